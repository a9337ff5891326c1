//! Data Relay Module
//!
//! Accepts clients, pairs each with a pooled upstream connection and relays
//! bytes in both directions.

pub mod server;
pub mod session;
pub mod stream;

pub use server::{DirectRelayServer, RelaySettings};
pub use session::{ClientSession, Direction, SessionInfo, SessionOptions};
pub use stream::{ByteRelayStream, RelayOutcome};
