// PeerLink Core: peer-to-peer messaging through a relay
//
// Peers never talk to each other directly. Each one holds a single
// connection to a relay, which resolves peer ids to connections and forwards
// addressed events, acknowledgements included. On the peer side three layers
// share that connection: addressing (many peers), sessions (one exclusive
// peer) and streams (flow-controlled byte channels).

pub mod error;
pub mod peer;
pub mod relay;
pub mod transport;

pub use error::P2pError;
pub use peer::{
    Addressing, DestroyCause, Incoming, ListenerHandle, PeerClient, PeerConfig, Session,
    SessionEvent, SessionState, StreamChannel, StreamError, StreamListener, StreamMux,
    StreamOptions, StreamState, TargetScope,
};
pub use relay::{RelayServer, RelayServerConfig, RelayServerError, RelayServerStats};
pub use transport::{AddressEncoding, LocalAcceptor, LocalConnector, TcpAcceptor, Value};
