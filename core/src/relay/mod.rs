//! Relay: peer registry, watch rooms and the forwarding server
//!
//! Peers connect to one relay and address each other by id. The relay is the
//! only place that knows which connection an id maps to.

pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod server;

pub use protocol::{ForwardRequest, RelayErrorNotice};
pub use registry::{
    OverwritePolicy, PeerRegistry, PeerRegistryEntry, RegistryConfig, RegistryError,
    RegistryStats,
};
pub use rooms::Rooms;
pub use server::{RelayServer, RelayServerConfig, RelayServerError, RelayServerStats};
