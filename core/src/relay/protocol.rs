//! Relay protocol: control event names and argument layouts
//!
//! Peers talk to the relay with a handful of `p2p-relay-*` events. Everything
//! else a peer sends to another peer rides inside `p2p-relay-forward` and is
//! re-emitted to the target untouched, apart from the sender attribution.

use crate::error::P2pError;
use crate::transport::{AddressEncoding, Value};

/// Prefix reserved for protocol events; applications may not emit these
pub const RESERVED_PREFIX: &str = "p2p-";

/// Prefix for events the relay itself interprets; never forwarded
pub const RELAY_PREFIX: &str = "p2p-relay-";

/// Separator used by the event-suffix sender encoding
pub const FROM_SEPARATOR: &str = "-from-";

/// Relay control event names
pub mod events {
    /// peer → relay: `[target, event, args]`, optional ack
    pub const FORWARD: &str = "p2p-relay-forward";
    /// peer → relay: `[peer]`, be told when `peer` disconnects; ack carries
    /// `[Bool present]`
    pub const WATCH: &str = "p2p-relay-watch";
    /// peer → relay: `[peer]`
    pub const UNWATCH: &str = "p2p-relay-unwatch";
    /// peer → relay: `[]`, ack carries `[List(peer ids)]`
    pub const PEERS: &str = "p2p-relay-peers";
    /// relay → peer: `[peer]`
    pub const PEER_DISCONNECTED: &str = "p2p-relay-peer-disconnected";
    /// relay → peer: `[kind, target, message]`
    pub const ERROR: &str = "p2p-relay-error";
}

/// Room holding every connection that watches `peer_id`
pub fn watch_room(peer_id: &str) -> String {
    format!("watch:{}", peer_id)
}

/// Attach the sender to an addressed event, as the receiving connection expects
pub fn encode_delivery(
    encoding: AddressEncoding,
    sender: &str,
    event: &str,
    mut args: Vec<Value>,
) -> (String, Vec<Value>) {
    match encoding {
        AddressEncoding::LeadingArg => {
            args.insert(0, Value::Text(sender.to_string()));
            (event.to_string(), args)
        }
        AddressEncoding::EventSuffix => (format!("{}{}{}", event, FROM_SEPARATOR, sender), args),
    }
}

/// Split an addressed event back into `(sender, event, args)`.
///
/// With the suffix encoding the split is on the last `-from-`; the registry
/// refuses peer ids containing the separator so the split is unambiguous.
pub fn decode_delivery(
    encoding: AddressEncoding,
    event: String,
    mut args: Vec<Value>,
) -> Option<(String, String, Vec<Value>)> {
    match encoding {
        AddressEncoding::LeadingArg => {
            if args.is_empty() {
                return None;
            }
            let sender = args.remove(0).into_text()?;
            Some((sender, event, args))
        }
        AddressEncoding::EventSuffix => {
            let (name, sender) = event.rsplit_once(FROM_SEPARATOR)?;
            if sender.is_empty() {
                return None;
            }
            Some((sender.to_string(), name.to_string(), args))
        }
    }
}

/// Body of a `p2p-relay-forward` event
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRequest {
    pub target: String,
    pub event: String,
    pub args: Vec<Value>,
}

impl ForwardRequest {
    pub fn new(target: impl Into<String>, event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            event: event.into(),
            args,
        }
    }

    pub fn into_args(self) -> Vec<Value> {
        vec![
            Value::Text(self.target),
            Value::Text(self.event),
            Value::List(self.args),
        ]
    }

    pub fn from_args(args: Vec<Value>) -> Result<Self, String> {
        let mut it = args.into_iter();
        let target = it
            .next()
            .and_then(Value::into_text)
            .ok_or("forward: missing target")?;
        let event = it
            .next()
            .and_then(Value::into_text)
            .ok_or("forward: missing event")?;
        let args = it
            .next()
            .and_then(Value::into_list)
            .ok_or("forward: missing args")?;
        Ok(Self {
            target,
            event,
            args,
        })
    }
}

/// Relay ack for a forward the target answered
pub fn ok_ack(peer_args: Vec<Value>) -> Vec<Value> {
    vec![Value::Bool(true), Value::List(peer_args)]
}

/// Relay ack for a forward that failed
pub fn err_ack(kind: &str, message: impl Into<String>) -> Vec<Value> {
    vec![
        Value::Bool(false),
        Value::Text(kind.to_string()),
        Value::Text(message.into()),
    ]
}

/// Interpret the relay's ack for a forward
pub fn parse_forward_ack(args: Vec<Value>) -> Result<Vec<Value>, P2pError> {
    let mut it = args.into_iter();
    match it.next().and_then(|v| v.as_bool()) {
        Some(true) => it
            .next()
            .and_then(Value::into_list)
            .ok_or_else(|| P2pError::Protocol("forward ack without payload".to_string())),
        Some(false) => {
            let kind = it.next().and_then(Value::into_text).unwrap_or_default();
            let message = it.next().and_then(Value::into_text).unwrap_or_default();
            Err(P2pError::from_relay(&kind, message))
        }
        None => Err(P2pError::Protocol("malformed forward ack".to_string())),
    }
}

/// Body of a `p2p-relay-error` event
#[derive(Debug, Clone, PartialEq)]
pub struct RelayErrorNotice {
    pub kind: String,
    pub target: String,
    pub message: String,
}

impl RelayErrorNotice {
    pub fn into_args(self) -> Vec<Value> {
        vec![
            Value::Text(self.kind),
            Value::Text(self.target),
            Value::Text(self.message),
        ]
    }

    pub fn from_args(args: Vec<Value>) -> Option<Self> {
        let mut it = args.into_iter().map(Value::into_text);
        Some(Self {
            kind: it.next()??,
            target: it.next()??,
            message: it.next()??,
        })
    }

    pub fn into_error(self) -> P2pError {
        P2pError::from_relay(&self.kind, format!("{}: {}", self.target, self.message))
    }
}

// ============================================================================
// TESTS
// ============================================================================
