//! In-memory links
//!
//! Used by tests and by applications that embed the relay in the same process
//! as its peers.

use super::abstraction::{Link, LinkAcceptor, LinkKind, TransportError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Create a pair of connected links
pub fn pair() -> (Link, Link) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    let a = Link {
        kind: LinkKind::Local,
        outbound: tx_b,
        inbound: rx_a,
    };
    let b = Link {
        kind: LinkKind::Local,
        outbound: tx_a,
        inbound: rx_b,
    };
    (a, b)
}

/// Hands the server end of in-memory links to a relay
pub struct LocalAcceptor {
    incoming: mpsc::UnboundedReceiver<Link>,
}

/// Dials a [`LocalAcceptor`]
#[derive(Clone)]
pub struct LocalConnector {
    dial_tx: mpsc::UnboundedSender<Link>,
}

impl LocalAcceptor {
    /// Create an acceptor and the connector that feeds it
    pub fn new() -> (LocalAcceptor, LocalConnector) {
        let (dial_tx, incoming) = mpsc::unbounded_channel();
        (LocalAcceptor { incoming }, LocalConnector { dial_tx })
    }
}

impl LocalConnector {
    /// Open a link to the acceptor, returning the client end
    pub fn connect(&self) -> Result<Link, TransportError> {
        let (client, server) = pair();
        self.dial_tx
            .send(server)
            .map_err(|_| TransportError::Io("local acceptor closed".to_string()))?;
        Ok(client)
    }
}

#[async_trait]
impl LinkAcceptor for LocalAcceptor {
    async fn accept(&mut self) -> Option<Result<Link, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }
}
