//! Operational Event Tracing
//!
//! A `Tracer` is an append-only sink for relay lifecycle events. The server
//! and its sessions hold it as `Arc<dyn Tracer>` so tests can swap in a
//! recording implementation.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::info;

/// Events emitted by the relay core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    ServerStarted {
        listen_addr: SocketAddr,
        upstream_addr: SocketAddr,
    },
    ServerClosed {
        listen_addr: SocketAddr,
    },
    SessionOpened {
        session_id: String,
        client_addr: SocketAddr,
        upstream_addr: SocketAddr,
    },
    /// Bytes relayed from the client to the upstream
    Sent {
        session_id: String,
        bytes: usize,
        from: SocketAddr,
        to: SocketAddr,
    },
    /// Bytes relayed from the upstream back to the client
    Received {
        session_id: String,
        bytes: usize,
        from: SocketAddr,
        to: SocketAddr,
    },
    SessionClosed {
        session_id: String,
        client_addr: SocketAddr,
        upstream_addr: SocketAddr,
    },
    DialFailed {
        client_addr: SocketAddr,
        upstream_addr: SocketAddr,
        attempts: u32,
        reason: String,
    },
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::ServerStarted {
                listen_addr,
                upstream_addr,
            } => write!(f, "start {} to {}..", listen_addr, upstream_addr),
            TraceEvent::ServerClosed { listen_addr } => write!(f, "close {}..", listen_addr),
            TraceEvent::SessionOpened {
                session_id,
                client_addr,
                upstream_addr,
            } => write!(f, "client {}[{}, {}] open..", session_id, client_addr, upstream_addr),
            TraceEvent::Sent {
                session_id,
                bytes,
                from,
                to,
            } => write!(f, "client {} sent {} bytes from {} to {}..", session_id, bytes, from, to),
            TraceEvent::Received {
                session_id,
                bytes,
                from,
                to,
            } => write!(f, "client {} recv {} bytes from {} to {}..", session_id, bytes, from, to),
            TraceEvent::SessionClosed {
                session_id,
                client_addr,
                upstream_addr,
            } => write!(f, "client {}[{}, {}] close..", session_id, client_addr, upstream_addr),
            TraceEvent::DialFailed {
                client_addr,
                upstream_addr,
                attempts,
                reason,
            } => write!(
                f,
                "client [{}] dial {} failed after {} attempt(s): {}",
                client_addr, upstream_addr, attempts, reason
            ),
        }
    }
}

/// Append-only line sink for relay events
pub trait Tracer: Send + Sync {
    /// Append one line
    fn write_line(&self, line: &str);

    /// Append an event; the default renders it as a line
    fn trace(&self, event: &TraceEvent) {
        self.write_line(&event.to_string());
    }
}

/// Forwards trace lines to the `tracing` subscriber
#[derive(Debug, Default)]
pub struct LogTracer {
    prefix: String,
}

impl LogTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Tracer for LogTracer {
    fn write_line(&self, line: &str) {
        info!(target: "directrelay::trace", "{}{}", self.prefix, line);
    }
}

/// Keeps every line and event in memory
#[derive(Debug, Default)]
pub struct MemoryTracer {
    lines: Mutex<Vec<String>>,
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Count events matching a predicate
    pub fn count(&self, predicate: impl Fn(&TraceEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl Tracer for MemoryTracer {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }

    fn trace(&self, event: &TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        self.write_line(&event.to_string());
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    #[inline]
    fn write_line(&self, _line: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tracer_records_events_and_lines() {
        let tracer = MemoryTracer::new();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let upstream: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        tracer.trace(&TraceEvent::Sent {
            session_id: "s1".to_string(),
            bytes: 4,
            from: addr,
            to: upstream,
        });
        tracer.write_line("free-form");

        assert_eq!(tracer.events().len(), 1);
        assert_eq!(
            tracer.lines(),
            vec![
                "client s1 sent 4 bytes from 127.0.0.1:4000 to 127.0.0.1:5000..".to_string(),
                "free-form".to_string(),
            ]
        );
        assert_eq!(tracer.count(|e| matches!(e, TraceEvent::Sent { bytes: 4, .. })), 1);
    }

    #[test]
    fn test_dial_failure_line() {
        let event = TraceEvent::DialFailed {
            client_addr: "127.0.0.1:4000".parse().unwrap(),
            upstream_addr: "127.0.0.1:5000".parse().unwrap(),
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            event.to_string(),
            "client [127.0.0.1:4000] dial 127.0.0.1:5000 failed after 3 attempt(s): connection refused"
        );
    }
}
