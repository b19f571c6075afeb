//! Peer-facing error taxonomy

use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the peer runtime (addressing, sessions and streams)
#[derive(Debug, Clone, Error)]
pub enum P2pError {
    /// A local precondition was violated; nothing was sent
    #[error("Registration conflict: {0}")]
    RegistrationConflict(String),

    /// The remote declined, or could not be reached
    #[error("Registration refused: {0}")]
    RegistrationRefused(String),

    /// The relay could not resolve a peer id
    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    /// Nobody on the remote side is accepting streams
    #[error("Stream create refused: {0}")]
    StreamCreateRefused(String),

    /// An open stream failed
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Relay-side inconsistency reported back to us
    #[error("Relay internal error: {0}")]
    RelayInternal(String),

    #[error("No active session")]
    NotRegistered,

    #[error("Event name {0:?} is reserved")]
    ReservedEvent(String),

    /// The relay could not deliver without exceeding the frame limit
    #[error("Message too large: {0}")]
    TooLarge(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Error kinds as they travel in relay error acknowledgements
pub(crate) mod kind {
    pub const TARGET_UNAVAILABLE: &str = "target-unavailable";
    pub const RELAY_INTERNAL: &str = "relay-internal";
    pub const RESERVED_EVENT: &str = "reserved-event";
    pub const MALFORMED: &str = "malformed";
    pub const TOO_LARGE: &str = "too-large";
}

impl P2pError {
    /// Rebuild an error reported by the relay
    pub(crate) fn from_relay(kind: &str, message: String) -> Self {
        match kind {
            kind::TARGET_UNAVAILABLE => P2pError::TargetUnavailable(message),
            kind::RESERVED_EVENT => P2pError::ReservedEvent(message),
            kind::MALFORMED => P2pError::Protocol(message),
            kind::TOO_LARGE => P2pError::TooLarge(message),
            _ => P2pError::RelayInternal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_relay_kinds() {
        assert!(matches!(
            P2pError::from_relay(kind::TARGET_UNAVAILABLE, "bob".into()),
            P2pError::TargetUnavailable(_)
        ));
        assert!(matches!(
            P2pError::from_relay("something-new", "x".into()),
            P2pError::RelayInternal(_)
        ));
    }

    #[test]
    fn test_transport_conversion() {
        let err: P2pError = TransportError::Disconnected.into();
        assert_eq!(err.to_string(), "Transport error: Connection closed");
    }
}
