// Transport module: frames, links and the event socket built on them

pub mod abstraction;
pub mod frame;
pub mod local;
pub mod socket;
pub mod tcp;
pub mod value;

pub use abstraction::{Link, LinkAcceptor, LinkKind, TransportError};
pub use frame::{AddressEncoding, Frame, FrameError, MAX_FRAME_LEN, PROTOCOL_VERSION};
pub use local::{LocalAcceptor, LocalConnector};
pub use socket::{Ack, AckResult, ListenerId, Socket};
pub use tcp::TcpAcceptor;
pub use value::Value;
