//! Device-facing layer: byte transports and the MINIPULS protocol driver.

pub mod minipuls;
pub mod mock;
pub mod transport;

pub use minipuls::{CommandInterval, DriverMode, MinipulsDriver};
pub use mock::{HandshakeReply, MockTransport};
#[cfg(feature = "instrument_serial")]
pub use transport::SerialTransport;
pub use transport::{SerialSettings, Transport};
