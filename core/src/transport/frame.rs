//! Wire frames exchanged between a peer and the relay

use super::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single encoded frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// How the relay tells a receiver who sent an addressed message.
///
/// Both encodings exist in deployed peers. A connection declares one in its
/// `Hello` and every delivery to that connection uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AddressEncoding {
    /// Sender id prepended as the first argument
    #[default]
    LeadingArg,
    /// Event name rewritten to `<event>-from-<senderId>`
    EventSuffix,
}

/// A frame sent over a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame from a peer: announces its identity
    Hello {
        version: u32,
        peer_id: String,
        encoding: AddressEncoding,
    },
    /// Relay's answer to `Hello`
    HelloAck {
        version: u32,
        accepted: bool,
        reason: Option<String>,
    },
    /// A named event, optionally expecting an acknowledgement
    Event {
        event: String,
        args: Vec<Value>,
        ack: Option<u64>,
    },
    /// Acknowledgement for an earlier `Event`
    Ack { id: u64, args: Vec<Value> },
    /// The receiver dropped the acknowledgement without answering
    Nack { id: u64 },
    /// Graceful disconnect
    Disconnect { reason: String },
}

/// Frame serialization errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
}

impl Frame {
    /// Serialize a frame to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let bytes =
            bincode::serialize(self).map_err(|e| FrameError::SerializationError(e.to_string()))?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Size of the encoded frame, without encoding it
    pub fn encoded_len(&self) -> Result<usize, FrameError> {
        bincode::serialized_size(self)
            .map(|len| len as usize)
            .map_err(|e| FrameError::SerializationError(e.to_string()))
    }

    /// Deserialize a frame from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        bincode::deserialize(bytes).map_err(|e| FrameError::DeserializationError(e.to_string()))
    }

    /// Get a human-readable description of the frame type
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "Hello",
            Frame::HelloAck { .. } => "HelloAck",
            Frame::Event { .. } => "Event",
            Frame::Ack { .. } => "Ack",
            Frame::Nack { .. } => "Nack",
            Frame::Disconnect { .. } => "Disconnect",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
