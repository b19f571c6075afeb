//! Peer runtime: what a peer uses to talk to other peers through a relay
//!
//! [`PeerClient`] owns the connection. On top of it sit three layers:
//! [`Addressing`] for messaging any number of peers by id, [`Session`] for a
//! single exclusive relationship, and [`StreamMux`] for duplex byte streams
//! over either.

pub mod addressing;
pub mod client;
pub mod protocol;
pub mod session;
pub mod stream;

pub use addressing::{Addressing, Incoming, ListenerHandle, TargetScope};
pub use client::{PeerClient, PeerConfig};
pub use session::{Session, SessionEvent, SessionState};
pub use stream::{
    DestroyCause, StreamChannel, StreamError, StreamListener, StreamMux, StreamOptions,
    StreamState,
};
