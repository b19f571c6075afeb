//! Relay Server: admits peer connections and forwards addressed events
//!
//! The relay never looks inside forwarded payloads. It resolves the target id
//! through the [`PeerRegistry`], attaches the sender's id in the encoding the
//! target declared at connect time, and pushes the event onto the target's
//! outbound queue from inside the origin connection's reader task. The
//! target's acknowledgement travels back the same way, from inside the target
//! connection's reader task, so per-pair ordering holds end to end.

use super::protocol::{
    encode_delivery, err_ack, events, ok_ack, watch_room, ForwardRequest,
    RelayErrorNotice, RELAY_PREFIX,
};
use super::registry::{OverwritePolicy, PeerRegistry, RegistryConfig, RegistryError};
use super::rooms::Rooms;
use crate::error::kind;
use crate::transport::{
    Ack, AddressEncoding, Frame, Link, LinkAcceptor, Socket, TransportError, Value,
    PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Let a new connection replace a registered peer id instead of refusing it
    pub client_overwrite: bool,
    /// How long a new link may take to announce itself
    pub handshake_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            client_overwrite: false,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default)]
pub struct RelayServerStats {
    /// Number of registered peers
    pub connections_active: usize,
    /// Connections refused at handshake
    pub connections_refused: u64,
    /// Events forwarded to a target
    pub events_forwarded: u64,
    /// Forward requests that could not be delivered
    pub forward_failures: u64,
    /// Acknowledgements carried back to an origin
    pub acks_relayed: u64,
    /// Approximate payload bytes forwarded
    pub bytes_relayed: u64,
}

/// Relay server error types
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("Peer id {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("Invalid peer id {0:?}")]
    InvalidPeerId(String),
    #[error("Unsupported protocol version {0}")]
    VersionMismatch(u32),
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] TransportError),
}

impl From<RegistryError> for RelayServerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered(id) => RelayServerError::AlreadyRegistered(id),
            RegistryError::ConnectionLimitExceeded => RelayServerError::ConnectionLimitExceeded,
            RegistryError::InvalidPeerId(id) => RelayServerError::InvalidPeerId(id),
        }
    }
}

/// The relay server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayServerConfig,
    registry: Arc<PeerRegistry>,
    rooms: Arc<Rooms>,
    /// Delivery encoding declared by each live connection
    encodings: Arc<RwLock<HashMap<u64, AddressEncoding>>>,
    stats: Arc<RwLock<RelayServerStats>>,
}

impl RelayServer {
    /// Create a new relay server with default configuration
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    /// Create a new relay server with custom configuration
    pub fn with_config(config: RelayServerConfig) -> Self {
        let registry = PeerRegistry::with_config(RegistryConfig {
            max_connections: config.max_connections,
            overwrite: OverwritePolicy::from_client_overwrite(config.client_overwrite),
        });
        Self {
            config,
            registry: Arc::new(registry),
            rooms: Arc::new(Rooms::new()),
            encodings: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayServerStats::default())),
        }
    }

    pub fn config(&self) -> &RelayServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Ids of every registered peer, sorted
    pub fn peers(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Get current server statistics
    pub fn get_stats(&self) -> RelayServerStats {
        let mut stats = self.stats.read().clone();
        stats.connections_active = self.registry.len();
        stats
    }

    /// Accept links until the acceptor closes. Each link is admitted on its
    /// own task.
    pub async fn serve<A>(&self, mut acceptor: A) -> Result<(), RelayServerError>
    where
        A: LinkAcceptor,
    {
        while let Some(next) = acceptor.accept().await {
            match next {
                Ok(link) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.accept(link).await {
                            warn!("connection rejected: {}", e);
                        }
                    });
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
        info!("relay acceptor closed");
        Ok(())
    }

    /// Run the handshake on a new link and, if it is admitted, serve it
    pub async fn accept(&self, mut link: Link) -> Result<Socket, RelayServerError> {
        let hello = tokio::time::timeout(self.config.handshake_timeout, link.recv_frame())
            .await
            .map_err(|_| RelayServerError::InvalidHandshake("timed out waiting for Hello".into()))??;

        let (peer_id, encoding) = match hello {
            Frame::Hello {
                version,
                peer_id,
                encoding,
            } => {
                if version != PROTOCOL_VERSION {
                    self.refuse(&link, &format!("unsupported protocol version {}", version));
                    return Err(RelayServerError::VersionMismatch(version));
                }
                (peer_id, encoding)
            }
            other => {
                self.refuse(&link, "expected Hello");
                return Err(RelayServerError::InvalidHandshake(format!(
                    "expected Hello, got {}",
                    other.frame_type()
                )));
            }
        };

        let outbound = link.outbound.clone();
        let socket = Socket::spawn(peer_id.clone(), link);
        let connection_id = socket.id();

        // Everything a forward to this connection needs must exist before the
        // registry makes it resolvable
        self.encodings.write().insert(connection_id, encoding);
        self.install_handlers(&socket);
        {
            let server = self.clone();
            let peer = peer_id.clone();
            socket.on_disconnect(move |reason| {
                debug!("connection {} ({}) gone: {}", connection_id, peer, reason);
                server.registry.remove_connection(&peer, connection_id);
                server.rooms.leave_all(connection_id);
                server.encodings.write().remove(&connection_id);
            });
        }

        let hello_ack = outbound.clone();
        let registered = self.registry.register_with(&peer_id, socket.clone(), move || {
            let _ = hello_ack.send(Frame::HelloAck {
                version: PROTOCOL_VERSION,
                accepted: true,
                reason: None,
            });
        });

        match registered {
            Ok(evicted) => {
                if let Some(old) = evicted {
                    info!("peer {} reconnected; connection {} evicted", peer_id, old.id());
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.stats.write().connections_refused += 1;
                let _ = outbound.send(Frame::HelloAck {
                    version: PROTOCOL_VERSION,
                    accepted: false,
                    reason: Some(reason.clone()),
                });
                socket.disconnect(&reason);
                return Err(e.into());
            }
        }

        let rooms = self.rooms.clone();
        self.registry.on_connection_removed(&peer_id, connection_id, move |peer| {
            let room = watch_room(peer);
            let notified = rooms.broadcast(
                &room,
                events::PEER_DISCONNECTED,
                vec![Value::from(peer)],
            );
            rooms.clear(&room);
            debug!("peer {} disconnected; notified {} watchers", peer, notified);
        });

        info!(
            "peer {} connected over {} (connection {}, {:?})",
            peer_id,
            socket.kind(),
            connection_id,
            encoding
        );
        Ok(socket)
    }

    /// Disconnect every registered peer
    pub fn shutdown(&self, reason: &str) {
        for peer in self.registry.list() {
            if let Some(socket) = self.registry.resolve(&peer) {
                socket.disconnect(reason);
            }
        }
    }

    fn refuse(&self, link: &Link, reason: &str) {
        self.stats.write().connections_refused += 1;
        let _ = link.send_frame(Frame::HelloAck {
            version: PROTOCOL_VERSION,
            accepted: false,
            reason: Some(reason.to_string()),
        });
        let _ = link.send_frame(Frame::Disconnect {
            reason: reason.to_string(),
        });
    }

    fn install_handlers(&self, socket: &Socket) {
        let server = self.clone();
        let origin = socket.clone();
        socket.on(events::FORWARD, move |args, ack| {
            server.forward(&origin, args, ack);
        });

        // Join first, then check presence: a peer that is still registered
        // after the join is guaranteed to notify this room when it leaves.
        // Watching an absent peer leaves no membership behind.
        let rooms = self.rooms.clone();
        let registry = self.registry.clone();
        let watcher = socket.clone();
        socket.on(events::WATCH, move |args, ack| {
            let present = match first_text(args) {
                Some(peer) => {
                    let room = watch_room(&peer);
                    rooms.join(&room, &watcher);
                    let present = registry.is_registered(&peer);
                    if !present {
                        rooms.leave(&room, watcher.id());
                    }
                    present
                }
                None => false,
            };
            if let Some(ack) = ack {
                ack.send(vec![Value::Bool(present)]);
            }
        });

        let rooms = self.rooms.clone();
        let connection_id = socket.id();
        socket.on(events::UNWATCH, move |args, ack| {
            if let Some(peer) = first_text(args) {
                rooms.leave(&watch_room(&peer), connection_id);
            }
            if let Some(ack) = ack {
                ack.send(vec![]);
            }
        });

        let registry = self.registry.clone();
        socket.on(events::PEERS, move |_args, ack| {
            if let Some(ack) = ack {
                let ids = registry.list().into_iter().map(Value::Text).collect();
                ack.send(vec![Value::List(ids)]);
            }
        });

        let peer = socket.peer_id().to_string();
        socket.set_fallback(move |event, _args, _ack| {
            debug!("ignoring {:?} from {}: not a relay event", event, peer);
        });
    }

    /// Forward one event on behalf of `origin`
    fn forward(&self, origin: &Socket, args: Vec<Value>, ack: Option<Ack>) {
        let request = match ForwardRequest::from_args(args) {
            Ok(request) => request,
            Err(msg) => {
                self.fail(origin, ack, kind::MALFORMED, "", &msg);
                return;
            }
        };

        if request.event.starts_with(RELAY_PREFIX) {
            let msg = format!("{} cannot be forwarded", request.event);
            self.fail(origin, ack, kind::RESERVED_EVENT, &request.target, &msg);
            return;
        }

        let Some(target) = self.registry.resolve(&request.target) else {
            self.fail(
                origin,
                ack,
                kind::TARGET_UNAVAILABLE,
                &request.target,
                "peer is not connected",
            );
            return;
        };

        let encoding = self
            .encodings
            .read()
            .get(&target.id())
            .copied()
            .unwrap_or_default();
        let bytes: usize = request.args.iter().map(Value::weight).sum();
        let (event, args) = encode_delivery(encoding, origin.peer_id(), &request.event, request.args);
        trace!(
            "forward {} -> {}: {} ({} bytes)",
            origin.peer_id(),
            request.target,
            event,
            bytes
        );

        match ack {
            Some(ack) => {
                let stats = self.stats.clone();
                let target_id = request.target.clone();
                target.emit_with_callback(event, args, move |result| match result {
                    Ok(reply) => {
                        stats.write().acks_relayed += 1;
                        ack.send(ok_ack(reply));
                    }
                    // Pass the drop on; the origin sees its own ack dropped
                    Err(TransportError::AckDropped) => drop(ack),
                    Err(TransportError::TooLarge(len)) => {
                        stats.write().forward_failures += 1;
                        ack.send(err_ack(
                            kind::TOO_LARGE,
                            format!("{}: delivery would be {} bytes", target_id, len),
                        ));
                    }
                    Err(e) => {
                        stats.write().forward_failures += 1;
                        ack.send(err_ack(
                            kind::TARGET_UNAVAILABLE,
                            format!("{}: {}", target_id, e),
                        ));
                    }
                });
            }
            None => match target.emit(event, args) {
                Ok(()) => {}
                Err(TransportError::TooLarge(len)) => {
                    let msg = format!("delivery would be {} bytes", len);
                    self.fail(origin, None, kind::TOO_LARGE, &request.target, &msg);
                    return;
                }
                Err(e) => {
                    // Resolved but already closed: the registry is lagging
                    error!("registry resolved closed connection for {}: {}", request.target, e);
                    let msg = e.to_string();
                    self.fail(origin, None, kind::RELAY_INTERNAL, &request.target, &msg);
                    return;
                }
            },
        }

        let mut stats = self.stats.write();
        stats.events_forwarded += 1;
        stats.bytes_relayed += bytes as u64;
    }

    /// Report a forwarding failure to the origin: through its ack if it asked
    /// for one, otherwise as a relay error event
    fn fail(&self, origin: &Socket, ack: Option<Ack>, kind: &str, target: &str, message: &str) {
        self.stats.write().forward_failures += 1;
        debug!(
            "forward from {} to {:?} failed ({}): {}",
            origin.peer_id(),
            target,
            kind,
            message
        );
        match ack {
            Some(ack) => ack.send(err_ack(kind, format!("{}: {}", target, message))),
            None => {
                let notice = RelayErrorNotice {
                    kind: kind.to_string(),
                    target: target.to_string(),
                    message: message.to_string(),
                };
                let _ = origin.emit(events::ERROR, notice.into_args());
            }
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

fn first_text(args: Vec<Value>) -> Option<String> {
    args.into_iter().next().and_then(Value::into_text)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::P2pError;
    use crate::relay::protocol::parse_forward_ack;
    use crate::transport::{local, MAX_FRAME_LEN};

    /// Connect a raw socket to the relay, bypassing the peer runtime
    async fn raw_peer(
        server: &RelayServer,
        peer_id: &str,
        encoding: AddressEncoding,
    ) -> Result<Socket, String> {
        let (client, relay_end) = local::pair();
        let mut client = client;
        client
            .send_frame(Frame::Hello {
                version: PROTOCOL_VERSION,
                peer_id: peer_id.to_string(),
                encoding,
            })
            .map_err(|e| e.to_string())?;
        let accepted = server.accept(relay_end).await;

        match client.recv_frame().await.map_err(|e| e.to_string())? {
            Frame::HelloAck { accepted: true, .. } => {
                accepted.map_err(|e| e.to_string())?;
                Ok(Socket::spawn(peer_id, client))
            }
            Frame::HelloAck { reason, .. } => Err(reason.unwrap_or_default()),
            other => Err(format!("unexpected {}", other.frame_type())),
        }
    }

    #[tokio::test]
    async fn test_forward_attaches_sender() {
        let server = RelayServer::new();
        let alice = raw_peer(&server, "alice", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");
        let bob = raw_peer(&server, "bob", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect bob");

        bob.on("ping", |args, ack| {
            assert_eq!(args[0], Value::from("alice"));
            if let Some(ack) = ack {
                ack.send(vec![Value::from("pong")]);
            }
        });

        let reply = alice
            .emit_with_ack(
                events::FORWARD,
                ForwardRequest::new("bob", "ping", vec![]).into_args(),
            )
            .await
            .expect("Failed to forward");
        assert_eq!(
            parse_forward_ack(reply).expect("Failed to parse ack"),
            vec![Value::from("pong")]
        );
        assert_eq!(server.get_stats().acks_relayed, 1);
    }

    #[tokio::test]
    async fn test_forward_uses_target_encoding() {
        let server = RelayServer::new();
        let alice = raw_peer(&server, "alice", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");
        let bob = raw_peer(&server, "bob", AddressEncoding::EventSuffix)
            .await
            .expect("Failed to connect bob");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bob.on("ping-from-alice", move |args, _| {
            let _ = tx.send(args);
        });

        alice
            .emit(
                events::FORWARD,
                ForwardRequest::new("bob", "ping", vec![Value::Int(7)]).into_args(),
            )
            .expect("Failed to emit");
        assert_eq!(rx.recv().await.unwrap(), vec![Value::Int(7)]);
    }

    #[tokio::test]
    async fn test_forward_to_absent_peer() {
        let server = RelayServer::new();
        let alice = raw_peer(&server, "alice", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");

        let reply = alice
            .emit_with_ack(
                events::FORWARD,
                ForwardRequest::new("nobody", "ping", vec![]).into_args(),
            )
            .await
            .expect("Failed to forward");
        assert!(matches!(
            parse_forward_ack(reply),
            Err(P2pError::TargetUnavailable(_))
        ));

        // Without an ack the failure arrives as an event
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        alice.on(events::ERROR, move |args, _| {
            let _ = tx.send(RelayErrorNotice::from_args(args));
        });
        alice
            .emit(
                events::FORWARD,
                ForwardRequest::new("nobody", "ping", vec![]).into_args(),
            )
            .expect("Failed to emit");
        let notice = rx.recv().await.unwrap().expect("Failed to parse notice");
        assert_eq!(notice.kind, kind::TARGET_UNAVAILABLE);
        assert_eq!(notice.target, "nobody");
    }

    #[tokio::test]
    async fn test_relay_events_are_not_forwarded() {
        let server = RelayServer::new();
        let alice = raw_peer(&server, "alice", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");
        let _bob = raw_peer(&server, "bob", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect bob");

        let reply = alice
            .emit_with_ack(
                events::FORWARD,
                ForwardRequest::new("bob", events::PEER_DISCONNECTED, vec![]).into_args(),
            )
            .await
            .expect("Failed to forward");
        assert!(matches!(
            parse_forward_ack(reply),
            Err(P2pError::ReservedEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_refused_by_default() {
        let server = RelayServer::new();
        let _first = raw_peer(&server, "alice", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");
        let second = raw_peer(&server, "alice", AddressEncoding::LeadingArg).await;
        assert!(second.is_err());
        assert_eq!(server.peers(), vec!["alice".to_string()]);
        assert_eq!(server.get_stats().connections_refused, 1);
    }

    #[tokio::test]
    async fn test_watchers_told_of_disconnect() {
        let server = RelayServer::new();
        let alice = raw_peer(&server, "alice", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");
        let bob = raw_peer(&server, "bob", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect bob");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        alice.on(events::PEER_DISCONNECTED, move |args, _| {
            let _ = tx.send(args);
        });
        let present = alice
            .emit_with_ack(events::WATCH, vec![Value::from("bob")])
            .await
            .expect("Failed to watch");
        assert_eq!(present, vec![Value::Bool(true)]);

        bob.disconnect("leaving");
        assert_eq!(rx.recv().await.unwrap(), vec![Value::from("bob")]);

        let peers = alice
            .emit_with_ack(events::PEERS, vec![])
            .await
            .expect("Failed to list peers");
        assert_eq!(peers, vec![Value::List(vec![Value::from("alice")])]);
    }

    #[tokio::test]
    async fn test_watch_absent_peer_leaves_no_room() {
        let server = RelayServer::new();
        let alice = raw_peer(&server, "alice", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");

        for ghost in ["ghost-1", "ghost-2", "ghost-3"] {
            let present = alice
                .emit_with_ack(events::WATCH, vec![Value::from(ghost)])
                .await
                .expect("Failed to watch");
            assert_eq!(present, vec![Value::Bool(false)]);
        }
        assert_eq!(server.rooms.room_count(), 0);

        let _bob = raw_peer(&server, "bob", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect bob");
        alice
            .emit_with_ack(events::WATCH, vec![Value::from("bob")])
            .await
            .expect("Failed to watch");
        assert!(server.rooms.is_member(&watch_room("bob"), alice.id()));
    }

    #[tokio::test]
    async fn test_oversized_delivery_answered_with_error() {
        let server = RelayServer::new();
        // A long sender id grows the delivery past the forward that carried it
        let sender = "s".repeat(512);
        let alice = raw_peer(&server, &sender, AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect alice");
        let bob = raw_peer(&server, "bob", AddressEncoding::LeadingArg)
            .await
            .expect("Failed to connect bob");
        bob.on("blob", |_args, ack| {
            if let Some(ack) = ack {
                ack.send(vec![]);
            }
        });

        let forward_len = |payload: usize| {
            Frame::Event {
                event: events::FORWARD.to_string(),
                args: ForwardRequest::new("bob", "blob", vec![Value::Bytes(vec![0; payload])])
                    .into_args(),
                ack: Some(1),
            }
            .encoded_len()
            .expect("Failed to size frame")
        };
        let payload = MAX_FRAME_LEN - forward_len(0);
        assert_eq!(forward_len(payload), MAX_FRAME_LEN);

        let reply = alice
            .emit_with_ack(
                events::FORWARD,
                ForwardRequest::new("bob", "blob", vec![Value::Bytes(vec![0; payload])])
                    .into_args(),
            )
            .await
            .expect("Failed to forward");
        assert!(matches!(
            parse_forward_ack(reply),
            Err(P2pError::TooLarge(_))
        ));
        assert!(!alice.is_closed());
        assert!(!bob.is_closed());
        assert_eq!(server.peers().len(), 2);
        assert_eq!(server.get_stats().forward_failures, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_refused() {
        let server = RelayServer::new();
        let (mut client, relay_end) = local::pair();
        client
            .send_frame(Frame::Hello {
                version: PROTOCOL_VERSION + 1,
                peer_id: "alice".to_string(),
                encoding: AddressEncoding::LeadingArg,
            })
            .unwrap();

        let result = server.accept(relay_end).await;
        assert!(matches!(result, Err(RelayServerError::VersionMismatch(_))));
        assert!(matches!(
            client.recv_frame().await.unwrap(),
            Frame::HelloAck { accepted: false, .. }
        ));
    }
}
