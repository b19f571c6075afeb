//! Transport abstraction layer
//!
//! A link is anything that can carry frames in both directions between a peer
//! and the relay. The peer runtime and the relay only ever see a [`Link`];
//! in-memory pairs and TCP connections both reduce to one.

use super::frame::{Frame, FrameError};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Kind of link backing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// In-process channel pair
    Local,
    /// Length-prefixed frames over TCP
    Tcp,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Local => write!(f, "Local"),
            LinkKind::Tcp => write!(f, "Tcp"),
        }
    }
}

/// One end of a bidirectional frame channel
#[derive(Debug)]
pub struct Link {
    /// What carries this link
    pub kind: LinkKind,
    /// Frames queued here are delivered to the other end in order
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Frames from the other end, in the order they were sent
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    /// Wait for the next frame, failing if the other end went away
    pub async fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        self.inbound.recv().await.ok_or(TransportError::Disconnected)
    }

    /// Queue a frame for the other end
    pub fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Source of incoming links for the relay
#[async_trait]
pub trait LinkAcceptor: Send {
    /// Wait for the next incoming link. `None` means the acceptor is closed.
    async fn accept(&mut self) -> Option<Result<Link, TransportError>>;
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Disconnected,

    #[error("Acknowledgement dropped by receiver")]
    AckDropped,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Io(String),

    #[error("Frame error: {0}")]
    Frame(String),

    /// Refused before queueing; the connection stays up
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge(len) => TransportError::TooLarge(len),
            other => TransportError::Frame(other.to_string()),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
