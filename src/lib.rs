//! DirectRelay Library
//!
//! A transparent TCP relay. Every client accepted on the listening socket is
//! paired with a pooled connection to a single upstream endpoint and bytes are
//! copied verbatim in both directions until either side goes away.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod probe;
pub mod relay;
pub mod retry;
pub mod shutdown;
pub mod trace;

pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{DialError, RelayError};
pub use pool::{ConnectionPool, Connector, PooledConnection, TcpConnector};
pub use relay::{ByteRelayStream, ClientSession, DirectRelayServer, RelaySettings};
pub use retry::RetryPolicy;
pub use shutdown::ShutdownCoordinator;
pub use trace::{LogTracer, MemoryTracer, NoopTracer, TraceEvent, Tracer};

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
