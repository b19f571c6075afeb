//! Peer-to-peer protocol events, carried inside relay forwards

/// `[]` + ack `[Bool true]`
pub const TARGET_ADD: &str = "p2p-target-add";
/// `[]` + ack `[Bool accepted]`
pub const SESSION_REGISTER: &str = "p2p-session-register";
/// `[]` + optional ack
pub const SESSION_UNREGISTER: &str = "p2p-session-unregister";
/// `[]`, sent by a peer closing its connection while in a session
pub const SESSION_DISCONNECT: &str = "p2p-session-disconnect";
/// `[Text sourceStreamId, Text targetStreamId]` + ack `[Bool accepted]`
pub const STREAM_CREATE: &str = "p2p-stream-create";

const STREAM_PREFIX: &str = "p2p-stream";

/// Largest chunk a stream puts in one event. Bigger writes are split.
pub const MAX_CHUNK_LEN: usize = 1024 * 1024;

/// Event carrying chunks written by the channel whose source id is `stream_id`
pub fn chunk_event(stream_id: &str) -> String {
    format!("{}-from-stream-{}", STREAM_PREFIX, stream_id)
}

/// Event announcing that the channel whose source id is `stream_id` is gone
pub fn destroy_event(stream_id: &str) -> String {
    format!("{}-destroy-from-stream-{}", STREAM_PREFIX, stream_id)
}

/// Read a leading `Bool` acknowledgement
pub(crate) fn accepted(args: &[crate::transport::Value]) -> bool {
    args.first().and_then(|v| v.as_bool()).unwrap_or(false)
}
