//! One side of a multiplexed duplex byte stream
//!
//! Chunks travel as addressed events named after the writer's source stream
//! id, each carrying an acknowledgement. The writer waits for that
//! acknowledgement before sending the next chunk. The reader withholds it
//! while its buffer sits at or above the high-water mark and releases it once
//! the application has read enough, so a slow reader stalls its writer
//! without any explicit window messages.

use crate::error::P2pError;
use crate::peer::addressing::{Addressing, HookId, Incoming, ListenerHandle};
use crate::peer::protocol::{chunk_event, destroy_event, MAX_CHUNK_LEN};
use crate::transport::{Ack, TransportError, Value};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, waiting for the remote to accept
    Negotiating,
    Open,
    Destroyed,
}

/// Why a channel was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyCause {
    /// `destroy()` was called locally
    Local,
    /// The channel failed
    Error(String),
    /// The remote peer (or our own connection) went away
    Disconnected,
    /// The remote destroyed its side
    PeerDestroyed,
    /// The remote never accepted the stream
    Refused,
}

/// Stream channel errors
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Stream destroyed")]
    Destroyed,
    #[error(transparent)]
    P2p(#[from] P2pError),
}

type ErrorHandler = Arc<dyn Fn(&P2pError) + Send + Sync>;
type DestroyedCallback = Box<dyn FnOnce(&str) + Send>;

struct ReadBuffer {
    chunks: VecDeque<Vec<u8>>,
    buffered: usize,
    /// Acknowledgement withheld while the buffer is over the high-water mark
    stashed: Option<Ack>,
}

#[derive(Default)]
struct Attachments {
    listeners: Vec<ListenerHandle>,
    hook: Option<HookId>,
}

struct ChannelInner {
    source_id: String,
    target_id: String,
    remote: String,
    addressing: Addressing,
    high_water_mark: usize,
    state: Mutex<StreamState>,
    cause: Mutex<Option<DestroyCause>>,
    read_buffer: Mutex<ReadBuffer>,
    readable: Notify,
    write_lock: tokio::sync::Mutex<()>,
    destroyed: watch::Sender<bool>,
    attachments: Mutex<Attachments>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    on_destroyed: Mutex<Option<DestroyedCallback>>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

/// A duplex byte channel to one remote peer. Cheap to clone; clones share
/// the same channel.
#[derive(Clone)]
pub struct StreamChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("source_id", &self.inner.source_id)
            .field("target_id", &self.inner.target_id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamChannel {
    pub(crate) fn new(
        addressing: Addressing,
        source_id: String,
        target_id: String,
        remote: String,
        high_water_mark: usize,
    ) -> StreamChannel {
        let (destroyed, _) = watch::channel(false);
        StreamChannel {
            inner: Arc::new(ChannelInner {
                source_id,
                target_id,
                remote,
                addressing,
                high_water_mark: high_water_mark.max(1),
                state: Mutex::new(StreamState::Negotiating),
                cause: Mutex::new(None),
                read_buffer: Mutex::new(ReadBuffer {
                    chunks: VecDeque::new(),
                    buffered: 0,
                    stashed: None,
                }),
                readable: Notify::new(),
                write_lock: tokio::sync::Mutex::new(()),
                destroyed,
                attachments: Mutex::new(Attachments::default()),
                error_handlers: Mutex::new(Vec::new()),
                on_destroyed: Mutex::new(None),
                bytes_written: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
            }),
        }
    }

    /// Our stream id; names the events we write
    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    /// The remote side's stream id; names the events we read
    pub fn target_id(&self) -> &str {
        &self.inner.target_id
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == StreamState::Destroyed
    }

    pub fn destroy_cause(&self) -> Option<DestroyCause> {
        self.inner.cause.lock().clone()
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.high_water_mark
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes received but not yet read
    pub fn buffered_len(&self) -> usize {
        self.inner.read_buffer.lock().buffered
    }

    /// Handle channel errors here instead of on the client's error stream
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&P2pError) + Send + Sync + 'static,
    {
        self.inner.error_handlers.lock().push(Arc::new(handler));
    }

    /// Detach every error handler; later errors go to the client's error stream
    pub fn clear_error_handlers(&self) {
        self.inner.error_handlers.lock().clear();
    }

    /// Write `data` and wait until the remote acknowledges it.
    ///
    /// Writes are serialized per channel, so at most one chunk is in flight.
    /// Data longer than [`MAX_CHUNK_LEN`] goes out as several chunks, each
    /// acknowledged before the next is sent.
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), StreamError> {
        let data = data.into();
        let _guard = self.inner.write_lock.lock().await;
        if self.is_destroyed() {
            return Err(StreamError::Destroyed);
        }
        for piece in split_chunks(data) {
            self.write_chunk(piece).await?;
        }
        Ok(())
    }

    async fn write_chunk(&self, data: Vec<u8>) -> Result<(), StreamError> {
        if self.is_destroyed() {
            return Err(StreamError::Destroyed);
        }
        let len = data.len() as u64;
        let mut destroyed = self.inner.destroyed.subscribe();
        let ack = self.inner.addressing.request(
            &self.inner.remote,
            &chunk_event(&self.inner.source_id),
            vec![Value::Bytes(data)],
        );

        tokio::select! {
            biased;
            _ = destroyed.wait_for(|gone| *gone) => Err(StreamError::Destroyed),
            result = ack => match result {
                Ok(_) => {
                    self.inner.bytes_written.fetch_add(len, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) if self.is_destroyed() => Err(StreamError::Destroyed),
                Err(e) => {
                    self.fail(e.clone());
                    Err(e.into())
                }
            },
        }
    }

    /// Next chunk from the remote. `None` once the channel is destroyed and
    /// everything buffered has been read.
    pub async fn read(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.inner.readable.notified();
            if let Some(chunk) = self.try_read() {
                return Some(chunk);
            }
            if self.is_destroyed() {
                return None;
            }
            notified.await;
        }
    }

    /// Next buffered chunk, without waiting
    pub fn try_read(&self) -> Option<Vec<u8>> {
        let (chunk, release) = {
            let mut buffer = self.inner.read_buffer.lock();
            let chunk = buffer.chunks.pop_front()?;
            buffer.buffered -= chunk.len();
            let release = if buffer.buffered < self.inner.high_water_mark {
                buffer.stashed.take()
            } else {
                None
            };
            (chunk, release)
        };
        if let Some(ack) = release {
            trace!("stream {}: drained below mark, releasing ack", self.inner.source_id);
            ack.send(vec![]);
        }
        self.inner
            .bytes_read
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Some(chunk)
    }

    /// Read until the channel is destroyed
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Resolve once the channel is destroyed
    pub async fn closed(&self) {
        let mut destroyed = self.inner.destroyed.subscribe();
        let _ = destroyed.wait_for(|gone| *gone).await;
    }

    /// Tear the channel down and tell the remote. Idempotent.
    pub fn destroy(&self) {
        self.destroy_with(DestroyCause::Local, true);
    }

    // ------------------------------------------------------------------------
    // Lifecycle, driven by the multiplexer
    // ------------------------------------------------------------------------

    /// Subscribe to this stream's chunk and destroy events. Done before the
    /// create request goes out so nothing the remote sends can be missed.
    pub(crate) fn attach_listeners(&self) {
        let remote = &self.inner.remote;
        let this = self.clone();
        let chunks = self.inner.addressing.listen_from(
            remote,
            chunk_event(&self.inner.target_id),
            move |incoming| this.on_chunk(incoming),
            false,
            true,
        );
        let this = self.clone();
        let destroy = self.inner.addressing.listen_from(
            remote,
            destroy_event(&self.inner.target_id),
            move |_| this.destroy_with(DestroyCause::PeerDestroyed, false),
            false,
            true,
        );
        self.inner.attachments.lock().listeners = vec![chunks, destroy];
    }

    /// Mark the channel open and follow the remote's presence
    pub(crate) fn open(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != StreamState::Negotiating {
                return;
            }
            *state = StreamState::Open;
        }

        let this = self.clone();
        let hook = self
            .inner
            .addressing
            .on_peer_gone(&self.inner.remote, move |_| {
                this.destroy_with(DestroyCause::Disconnected, false)
            });
        // The hook may already have run and torn us down
        let stale = {
            let mut attachments = self.inner.attachments.lock();
            if self.is_destroyed() {
                true
            } else {
                attachments.hook = Some(hook);
                false
            }
        };
        if stale {
            self.inner.addressing.remove_hook(&self.inner.remote, hook);
        }
        debug!(
            "stream {} <-> {} open with {}",
            self.inner.source_id, self.inner.target_id, self.inner.remote
        );
    }

    pub(crate) fn set_on_destroyed<F>(&self, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        *self.inner.on_destroyed.lock() = Some(Box::new(callback));
    }

    /// Runs in the reader task for every chunk the remote writes
    fn on_chunk(&self, mut incoming: Incoming) {
        let ack = incoming.take_ack();
        if self.is_destroyed() {
            return;
        }
        let Some(bytes) = incoming.args.into_iter().next().and_then(Value::into_bytes) else {
            self.fail(P2pError::ChannelError(format!(
                "malformed chunk on stream {}",
                self.inner.target_id
            )));
            return;
        };
        if bytes.is_empty() {
            if let Some(ack) = ack {
                ack.send(vec![]);
            }
            return;
        }

        let release = {
            let mut buffer = self.inner.read_buffer.lock();
            buffer.buffered += bytes.len();
            buffer.chunks.push_back(bytes);
            if buffer.buffered >= self.inner.high_water_mark {
                // Hold the writer until the reader catches up
                std::mem::replace(&mut buffer.stashed, ack)
            } else {
                ack
            }
        };
        if let Some(ack) = release {
            ack.send(vec![]);
        }
        self.inner.readable.notify_waiters();
    }

    /// Log, notify error handlers (or escalate if there are none), then destroy
    pub(crate) fn fail(&self, err: P2pError) {
        if self.is_destroyed() {
            return;
        }
        warn!(
            "stream {} with {} failed: {}",
            self.inner.source_id, self.inner.remote, err
        );
        let handlers = self.inner.error_handlers.lock().clone();
        if handlers.is_empty() {
            self.inner.addressing.report(err.clone());
        } else {
            for handler in handlers {
                handler(&err);
            }
        }
        let reachable = !matches!(
            err,
            P2pError::TargetUnavailable(_) | P2pError::Transport(TransportError::Disconnected)
        );
        self.destroy_with(DestroyCause::Error(err.to_string()), reachable);
    }

    pub(crate) fn destroy_with(&self, cause: DestroyCause, notify: bool) {
        {
            let mut state = self.inner.state.lock();
            if *state == StreamState::Destroyed {
                return;
            }
            *state = StreamState::Destroyed;
        }
        debug!(
            "stream {} with {} destroyed: {:?}",
            self.inner.source_id, self.inner.remote, cause
        );
        *self.inner.cause.lock() = Some(cause);

        let attachments = std::mem::take(&mut *self.inner.attachments.lock());
        for listener in attachments.listeners {
            self.inner.addressing.off(listener);
        }
        if let Some(hook) = attachments.hook {
            self.inner.addressing.remove_hook(&self.inner.remote, hook);
        }

        self.inner.destroyed.send_replace(true);
        self.inner.readable.notify_waiters();

        if notify {
            let _ = self.inner.addressing.send(
                &self.inner.remote,
                &destroy_event(&self.inner.source_id),
                vec![],
            );
        }

        // Dropping a withheld ack releases the writer with a Nack. It must
        // trail the destroy notice so the writer sees a destroyed stream.
        let stashed = self.inner.read_buffer.lock().stashed.take();
        drop(stashed);

        self.inner.error_handlers.lock().clear();
        let callback = self.inner.on_destroyed.lock().take();
        if let Some(callback) = callback {
            callback(&self.inner.source_id);
        }
    }
}

fn split_chunks(data: Vec<u8>) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    if data.len() <= MAX_CHUNK_LEN {
        return vec![data];
    }
    data.chunks(MAX_CHUNK_LEN).map(<[u8]>::to_vec).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{encode_delivery, events, ok_ack, ForwardRequest};
    use crate::transport::{local, AddressEncoding, Frame, Link, Socket};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A channel to "bob" whose relay end is driven by the test
    fn detached(
        high_water_mark: usize,
    ) -> (StreamChannel, Link, mpsc::UnboundedReceiver<P2pError>) {
        let (link, relay_end) = local::pair();
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let (_socket, addressing) = Socket::spawn_with("me", link, |socket| {
            Addressing::attach(socket, "me", AddressEncoding::LeadingArg, errors)
        });
        let channel = StreamChannel::new(
            addressing,
            "mine".to_string(),
            "theirs".to_string(),
            "bob".to_string(),
            high_water_mark,
        );
        channel.attach_listeners();
        (channel, relay_end, errors_rx)
    }

    fn chunk(relay_end: &Link, arg: Value, ack: Option<u64>) {
        let (event, args) = encode_delivery(
            AddressEncoding::LeadingArg,
            "bob",
            &chunk_event("theirs"),
            vec![arg],
        );
        relay_end
            .send_frame(Frame::Event { event, args, ack })
            .expect("Failed to deliver chunk");
    }

    /// Wait for an acknowledgement frame, skipping everything else
    async fn next_ack(relay_end: &mut Link) -> u64 {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), relay_end.recv_frame())
                .await
                .expect("Timed out waiting for ack")
                .expect("Failed to receive frame");
            if let Frame::Ack { id, .. } = frame {
                return id;
            }
        }
    }

    #[tokio::test]
    async fn test_ack_withheld_at_high_water_mark() {
        let (channel, mut relay_end, _errors) = detached(8);

        chunk(&relay_end, Value::Bytes(vec![1; 4]), Some(1));
        assert_eq!(next_ack(&mut relay_end).await, 1);

        chunk(&relay_end, Value::Bytes(vec![2; 4]), Some(2));
        chunk(&relay_end, Value::Bytes(vec![]), Some(3));
        // The empty chunk is answered while the full one is held back
        assert_eq!(next_ack(&mut relay_end).await, 3);
        assert_eq!(channel.buffered_len(), 8);

        assert_eq!(channel.try_read(), Some(vec![1; 4]));
        assert_eq!(next_ack(&mut relay_end).await, 2);
        assert_eq!(channel.try_read(), Some(vec![2; 4]));
        assert_eq!(channel.try_read(), None);
        assert_eq!(channel.bytes_read(), 8);
    }

    #[tokio::test]
    async fn test_malformed_chunk_goes_to_handler() {
        let (channel, relay_end, mut errors) = detached(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_error(move |err| {
            let _ = tx.send(err.clone());
        });

        chunk(&relay_end, Value::Int(5), None);

        let err = rx.recv().await.expect("Failed to receive channel error");
        assert!(matches!(err, P2pError::ChannelError(_)));
        assert!(channel.is_destroyed());
        assert!(matches!(channel.destroy_cause(), Some(DestroyCause::Error(_))));
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unhandled_error_escalates() {
        let (channel, relay_end, mut errors) = detached(8);

        chunk(&relay_end, Value::from("not bytes"), None);

        let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .expect("Timed out waiting for escalated error")
            .expect("Error stream closed");
        assert!(matches!(err, P2pError::ChannelError(_)));
        assert!(channel.is_destroyed());
    }

    #[test]
    fn test_split_chunks() {
        assert!(split_chunks(Vec::new()).is_empty());
        assert_eq!(split_chunks(vec![1; 10]), vec![vec![1; 10]]);
        let pieces = split_chunks(vec![2; MAX_CHUNK_LEN * 2 + 5]);
        let lens: Vec<usize> = pieces.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![MAX_CHUNK_LEN, MAX_CHUNK_LEN, 5]);
    }

    #[tokio::test]
    async fn test_large_write_goes_out_in_acknowledged_chunks() {
        let (channel, mut relay_end, _errors) = detached(8);
        channel.open();
        let total = MAX_CHUNK_LEN * 2 + 5;

        let writer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.write(vec![7u8; total]).await })
        };

        let mut sizes = Vec::new();
        while sizes.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(5), relay_end.recv_frame())
                .await
                .expect("Timed out waiting for chunk")
                .expect("Failed to receive frame");
            let Frame::Event { event, args, ack } = frame else {
                continue;
            };
            if event != events::FORWARD {
                if let Some(id) = ack {
                    let _ = relay_end.send_frame(Frame::Ack { id, args: vec![Value::Bool(true)] });
                }
                continue;
            }
            let request = ForwardRequest::from_args(args).expect("Failed to parse forward");
            assert_eq!(request.event, chunk_event("mine"));
            let bytes = request.args[0].as_bytes().expect("Chunk without bytes").len();
            sizes.push(bytes);
            let id = ack.expect("Chunk without ack");
            relay_end
                .send_frame(Frame::Ack { id, args: ok_ack(vec![]) })
                .expect("Failed to ack chunk");
        }

        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("Timed out waiting for writer")
            .expect("Writer task panicked")
            .expect("Failed to write");
        assert_eq!(sizes, vec![MAX_CHUNK_LEN, MAX_CHUNK_LEN, 5]);
        assert_eq!(channel.bytes_written(), total as u64);
        assert!(!channel.is_destroyed());
    }

    #[tokio::test]
    async fn test_read_ends_after_destroy() {
        let (channel, relay_end, _errors) = detached(8);
        chunk(&relay_end, Value::Bytes(b"tail".to_vec()), None);

        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.read_to_end().await })
        };
        while channel.buffered_len() == 0 && channel.bytes_read() == 0 {
            tokio::task::yield_now().await;
        }
        channel.destroy();

        let data = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("Timed out waiting for reader")
            .expect("Reader task panicked");
        assert_eq!(data, b"tail");
        assert_eq!(channel.state(), StreamState::Destroyed);
        assert!(matches!(
            channel.write(b"late".to_vec()).await,
            Err(StreamError::Destroyed)
        ));
    }
}
