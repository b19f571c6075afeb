// Stream multiplexer: many duplex byte channels over one connection

pub mod channel;
pub mod mux;

pub use channel::{DestroyCause, StreamChannel, StreamError, StreamState};
pub use mux::{StreamListener, StreamMux, StreamOptions, DEFAULT_HIGH_WATER_MARK};
