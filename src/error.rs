//! Relay Error Types

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to dial upstream {addr} after {attempts} attempt(s): {source}")]
    Dial {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: DialError,
    },

    #[error("Relay I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to close {what}: {source}")]
    Close {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// A single failed attempt to obtain an upstream connection
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection pool for {addr} exhausted ({max_active} active)")]
    Exhausted { addr: SocketAddr, max_active: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_names_address() {
        let err = RelayError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("127.0.0.1:80"));
    }

    #[test]
    fn test_dial_error_message_names_attempts() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let err = RelayError::Dial {
            addr,
            attempts: 4,
            source: DialError::Exhausted { addr, max_active: 2 },
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempt(s)"), "{}", msg);
        assert!(msg.contains("exhausted"), "{}", msg);
    }
}
