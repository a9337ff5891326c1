//! Client Session
//!
//! A session pairs one accepted client socket with one pooled upstream
//! connection and relays both directions on separate tasks. Whichever
//! direction stops first closes the session; the cancellation that follows
//! pulls the other direction out of its pending read.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::server::ServerShared;
use super::stream::{ByteRelayStream, RelayOutcome};
use crate::error::RelayError;
use crate::pool::{Lease, PooledConnection};
use crate::trace::{TraceEvent, Tracer};

type RelayHalf = ByteRelayStream<OwnedReadHalf, OwnedWriteHalf>;

/// Relay direction within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream
    Upstream,
    /// Upstream to client
    Downstream,
}

/// Per-session relay options
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub buffer_size: usize,
    pub trace_chunks: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            trace_chunks: true,
        }
    }
}

/// Snapshot of an active session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub closed: bool,
}

/// Socket halves handed back by the relay tasks
#[derive(Default)]
struct ReleasedParts {
    lease: Option<Lease>,
    /// Client read half, upstream write half
    upstream: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    /// Upstream read half, client write half
    downstream: Option<(OwnedReadHalf, OwnedWriteHalf)>,
}

/// One client connection relayed to one upstream connection
pub struct ClientSession {
    id: String,
    client_addr: SocketAddr,
    upstream_addr: SocketAddr,
    started_at: Instant,
    trace_chunks: bool,
    closed: AtomicBool,
    inbound_open: AtomicBool,
    outbound_open: AtomicBool,
    io_failed: AtomicBool,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    cancel: CancellationToken,
    released: CancellationToken,
    streams: Mutex<Option<(RelayHalf, RelayHalf)>>,
    parts: Mutex<ReleasedParts>,
    server: Weak<ServerShared>,
    tracer: Arc<dyn Tracer>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ClientSession {
    /// Wire the two relay directions; no I/O happens here
    pub(crate) fn new(
        inbound: TcpStream,
        client_addr: SocketAddr,
        outbound: PooledConnection,
        options: SessionOptions,
        server: Weak<ServerShared>,
        tracer: Arc<dyn Tracer>,
    ) -> Arc<Self> {
        let upstream_addr = outbound.addr();
        let connection_id = outbound.id();
        let cancel = CancellationToken::new();

        let (inbound_read, inbound_write) = inbound.into_split();
        let (outbound_read, outbound_write, lease) = outbound.into_split();

        let upstream = ByteRelayStream::new(inbound_read, outbound_write, options.buffer_size, cancel.clone());
        let downstream = ByteRelayStream::new(outbound_read, inbound_write, options.buffer_size, cancel.clone());

        let id = uuid::Uuid::new_v4().to_string();
        debug!(
            "Creating new relay session: {} ({} -> {} over connection #{})",
            id, client_addr, upstream_addr, connection_id
        );

        Arc::new(Self {
            id,
            client_addr,
            upstream_addr,
            started_at: Instant::now(),
            trace_chunks: options.trace_chunks,
            closed: AtomicBool::new(false),
            inbound_open: AtomicBool::new(true),
            outbound_open: AtomicBool::new(true),
            io_failed: AtomicBool::new(false),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            cancel,
            released: CancellationToken::new(),
            streams: Mutex::new(Some((upstream, downstream))),
            parts: Mutex::new(ReleasedParts {
                lease: Some(lease),
                ..ReleasedParts::default()
            }),
            server,
            tracer,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Both sockets are still connected and the session has not closed
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.inbound_open.load(Ordering::Acquire)
            && self.outbound_open.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether both sockets have been let go
    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    /// Resolves once the client socket is closed and the upstream connection
    /// is back with its pool
    pub async fn wait_released(&self) {
        self.released.cancelled().await
    }

    /// Spawn the two relay directions; later calls do nothing
    pub fn start(self: &Arc<Self>) {
        let Some((upstream, downstream)) = lock(&self.streams).take() else {
            return;
        };

        self.tracer.trace(&TraceEvent::SessionOpened {
            session_id: self.id.clone(),
            client_addr: self.client_addr,
            upstream_addr: self.upstream_addr,
        });
        info!(
            "Started relay session {} from {} to {}",
            self.id, self.client_addr, self.upstream_addr
        );

        tokio::spawn(Arc::clone(self).run_direction(upstream, Direction::Upstream));
        tokio::spawn(Arc::clone(self).run_direction(downstream, Direction::Downstream));
    }

    async fn run_direction(self: Arc<Self>, mut stream: RelayHalf, direction: Direction) {
        let result = stream
            .direct_data(|| self.is_alive(), |bytes| self.on_chunk(direction, bytes))
            .await;

        match result {
            Ok(RelayOutcome::Eof) => {
                debug!(session_id = %self.id, ?direction, "Peer closed its side");
                match direction {
                    Direction::Upstream => self.inbound_open.store(false, Ordering::Release),
                    Direction::Downstream => self.outbound_open.store(false, Ordering::Release),
                }
            }
            Ok(outcome) => {
                debug!(session_id = %self.id, ?direction, ?outcome, "Relay direction finished");
            }
            Err(e) => {
                debug!(session_id = %self.id, ?direction, "Relay direction failed: {}", e);
                self.io_failed.store(true, Ordering::Release);
            }
        }

        self.close();

        let (reader, writer) = stream.into_inner();
        self.reclaim(direction, reader, writer).await;
    }

    fn on_chunk(&self, direction: Direction, bytes: usize) -> bool {
        let event = match direction {
            Direction::Upstream => {
                self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
                TraceEvent::Sent {
                    session_id: self.id.clone(),
                    bytes,
                    from: self.client_addr,
                    to: self.upstream_addr,
                }
            }
            Direction::Downstream => {
                self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
                TraceEvent::Received {
                    session_id: self.id.clone(),
                    bytes,
                    from: self.upstream_addr,
                    to: self.client_addr,
                }
            }
        };

        if self.trace_chunks {
            self.tracer.trace(&event);
        }
        true
    }

    /// Close the session. Returns true for the one call that tore it down.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.tracer.trace(&TraceEvent::SessionClosed {
            session_id: self.id.clone(),
            client_addr: self.client_addr,
            upstream_addr: self.upstream_addr,
        });

        self.cancel.cancel();
        self.discard_unstarted();

        if let Some(server) = self.server.upgrade() {
            server.unregister(&self.id);
        }

        self.log_stats();
        true
    }

    /// A session closed before `start` still owns its streams
    fn discard_unstarted(&self) {
        if let Some(streams) = lock(&self.streams).take() {
            drop(streams);
            drop(lock(&self.parts).lease.take());
            self.released.cancel();
            debug!(session_id = %self.id, "Discarded session that never started");
        }
    }

    async fn reclaim(&self, direction: Direction, reader: OwnedReadHalf, writer: OwnedWriteHalf) {
        let (upstream, downstream, lease) = {
            let mut parts = lock(&self.parts);
            match direction {
                Direction::Upstream => parts.upstream = Some((reader, writer)),
                Direction::Downstream => parts.downstream = Some((reader, writer)),
            }
            if parts.upstream.is_none() || parts.downstream.is_none() {
                return;
            }
            (parts.upstream.take(), parts.downstream.take(), parts.lease.take())
        };

        if let (Some(upstream), Some(downstream)) = (upstream, downstream) {
            self.release_sockets(upstream, downstream, lease).await;
        }
    }

    async fn release_sockets(
        &self,
        (inbound_read, outbound_write): (OwnedReadHalf, OwnedWriteHalf),
        (outbound_read, inbound_write): (OwnedReadHalf, OwnedWriteHalf),
        lease: Option<Lease>,
    ) {
        match inbound_read.reunite(inbound_write) {
            Ok(mut inbound) => {
                if let Err(source) = inbound.shutdown().await {
                    let err = RelayError::Close {
                        what: "client socket",
                        source,
                    };
                    debug!(session_id = %self.id, "{}", err);
                }
            }
            Err(e) => debug!(session_id = %self.id, "Client socket halves mismatched: {}", e),
        }

        if let Some(mut lease) = lease {
            if !self.outbound_reusable() {
                lease.mark_unreusable();
            }
            match lease.reunite(outbound_read, outbound_write) {
                Ok(outbound) => outbound.close(),
                Err(e) => debug!(session_id = %self.id, "Upstream socket halves mismatched: {}", e),
            }
        }

        self.released.cancel();
        debug!(session_id = %self.id, "Session sockets released");
    }

    /// An upstream connection is only clean if nothing crossed it
    fn outbound_reusable(&self) -> bool {
        self.bytes_up() == 0
            && self.bytes_down() == 0
            && self.outbound_open.load(Ordering::Acquire)
            && !self.io_failed.load(Ordering::Acquire)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            client_addr: self.client_addr,
            upstream_addr: self.upstream_addr,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            closed: self.is_closed(),
        }
    }

    fn log_stats(&self) {
        info!(
            session_id = %self.id,
            client_addr = %self.client_addr,
            upstream_addr = %self.upstream_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            "Relay session closed"
        );
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("upstream_addr", &self.upstream_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
