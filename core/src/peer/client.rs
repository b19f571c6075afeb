//! Peer Client: connects a local peer to a relay
//!
//! One connection carries everything: addressed messages, the session and
//! every stream. The handshake announces the peer id and the delivery encoding
//! this connection wants; the relay refuses the id if it is already taken
//! (unless it runs with client overwrite).

use super::addressing::{Addressing, ErrorSink};
use super::session::Session;
use super::stream::{StreamMux, StreamOptions, DEFAULT_HIGH_WATER_MARK};
use crate::error::P2pError;
use crate::transport::{
    tcp, AddressEncoding, Frame, Link, LocalConnector, Socket, TransportError, PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Peer client configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// How the relay should attribute senders on deliveries to us
    pub encoding: AddressEncoding,
    /// Bounded wait for the remote's acknowledgement of a session unregister
    pub unregister_timeout: Duration,
    /// Bounded wait for the relay's answer to our hello
    pub handshake_timeout: Duration,
    /// Default high-water mark for streams
    pub stream_high_water_mark: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            encoding: AddressEncoding::LeadingArg,
            unregister_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            stream_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

struct ClientInner {
    peer_id: String,
    socket: Socket,
    addressing: Addressing,
    session: Session,
    streams: StreamMux,
    errors: Mutex<mpsc::UnboundedReceiver<P2pError>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.socket.disconnect("client dropped");
    }
}

/// A connected peer. Cheap to clone; the connection closes when the last
/// clone is dropped.
#[derive(Clone)]
pub struct PeerClient {
    inner: Arc<ClientInner>,
}

impl PeerClient {
    /// Handshake over `link` and start serving it
    pub async fn connect(
        mut link: Link,
        peer_id: &str,
        config: PeerConfig,
    ) -> Result<PeerClient, P2pError> {
        link.send_frame(Frame::Hello {
            version: PROTOCOL_VERSION,
            peer_id: peer_id.to_string(),
            encoding: config.encoding,
        })?;

        let reply = tokio::time::timeout(config.handshake_timeout, link.recv_frame())
            .await
            .map_err(|_| TransportError::Timeout("waiting for relay hello".to_string()))??;
        match reply {
            Frame::HelloAck { accepted: true, .. } => {}
            Frame::HelloAck { reason, .. } => {
                return Err(P2pError::RegistrationRefused(
                    reason.unwrap_or_else(|| "refused by relay".to_string()),
                ));
            }
            other => {
                return Err(P2pError::Protocol(format!(
                    "expected HelloAck, got {}",
                    other.frame_type()
                )));
            }
        }

        let (errors_tx, errors_rx): (ErrorSink, _) = mpsc::unbounded_channel();
        let (socket, (addressing, session, streams)) = Socket::spawn_with(peer_id, link, |socket| {
            let addressing = Addressing::attach(socket, peer_id, config.encoding, errors_tx);
            let session = Session::attach(&addressing, config.unregister_timeout);
            let streams = StreamMux::attach(
                &addressing,
                &session,
                StreamOptions::with_high_water_mark(config.stream_high_water_mark),
            );
            (addressing, session, streams)
        });
        info!("{} connected to relay over {}", peer_id, socket.kind());

        Ok(PeerClient {
            inner: Arc::new(ClientInner {
                peer_id: peer_id.to_string(),
                socket,
                addressing,
                session,
                streams,
                errors: Mutex::new(errors_rx),
            }),
        })
    }

    /// Dial a relay over TCP (`host:port` or `tcp://host:port`)
    pub async fn connect_tcp(
        address: &str,
        peer_id: &str,
        config: PeerConfig,
    ) -> Result<PeerClient, P2pError> {
        let link = tcp::connect(address).await?;
        Self::connect(link, peer_id, config).await
    }

    /// Connect to a relay in the same process
    pub async fn connect_local(
        connector: &LocalConnector,
        peer_id: &str,
        config: PeerConfig,
    ) -> Result<PeerClient, P2pError> {
        let link = connector.connect()?;
        Self::connect(link, peer_id, config).await
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn addressing(&self) -> &Addressing {
        &self.inner.addressing
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn streams(&self) -> &StreamMux {
        &self.inner.streams
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.socket.is_closed()
    }

    /// Next failure no caller was waiting on: undeliverable emits reported
    /// by the relay, and stream errors with no handler attached
    pub async fn next_error(&self) -> Option<P2pError> {
        self.inner.errors.lock().await.recv().await
    }

    /// Resolve once the connection to the relay has closed
    pub async fn closed(&self) {
        self.inner.socket.closed().await
    }

    /// Leave the relay. The session peer, if any, is told first.
    pub fn disconnect(&self) {
        debug!("{} disconnecting", self.inner.peer_id);
        self.inner.session.notify_disconnect();
        self.inner.socket.disconnect("client disconnect");
    }
}
