//! Upstream Connection Pool
//!
//! Dials upstream connections through a pluggable [`Connector`] and keeps
//! released connections idle for reuse. A borrowed [`PooledConnection`] is
//! handed back with [`PooledConnection::close`], which recycles it when it is
//! still clean and discards it otherwise.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf, ReuniteError};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::DialError;

/// Opens raw connections to an upstream address
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain TCP connector with a per-attempt timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, self.connect_timeout),
                ))
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// An idle connection waiting in the pool
#[derive(Debug)]
struct IdleConnection {
    stream: TcpStream,
    id: u64,
    created_at: Instant,
    idle_since: Instant,
}

#[derive(Debug, Default)]
struct PoolCounters {
    dialed: AtomicUsize,
    dial_failures: AtomicUsize,
    reused: AtomicUsize,
    recycled: AtomicUsize,
    discarded: AtomicUsize,
    exhausted: AtomicUsize,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub dialed: usize,
    pub dial_failures: usize,
    pub reused: usize,
    pub recycled: usize,
    pub discarded: usize,
    pub exhausted: usize,
    pub idle: usize,
}

/// Pool of upstream connections keyed by address
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    idle: Mutex<HashMap<SocketAddr, Vec<IdleConnection>>>,
    active_limit: Option<Arc<Semaphore>>,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let active_limit = (config.max_active > 0).then(|| Arc::new(Semaphore::new(config.max_active)));

        Self {
            connector,
            config,
            idle: Mutex::new(HashMap::new()),
            active_limit,
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
        }
    }

    /// Borrow a connection to `addr`, reusing an idle one when possible
    pub async fn borrow(self: &Arc<Self>, addr: SocketAddr) -> Result<PooledConnection, DialError> {
        let permit = match &self.active_limit {
            Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Connection pool for {} exhausted ({} active)",
                        addr, self.config.max_active
                    );
                    return Err(DialError::Exhausted {
                        addr,
                        max_active: self.config.max_active,
                    });
                }
            },
            None => None,
        };

        if let Some(idle) = self.take_idle(addr) {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Reusing pooled connection #{} to {} (idle {:?})",
                idle.id,
                addr,
                idle.idle_since.elapsed()
            );
            return Ok(PooledConnection {
                stream: idle.stream,
                lease: Lease::new(self, addr, idle.id, idle.created_at, permit),
            });
        }

        match self.connector.connect(addr).await {
            Ok(stream) => {
                self.counters.dialed.fetch_add(1, Ordering::Relaxed);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                debug!("Dialed new connection #{} to {}", id, addr);
                Ok(PooledConnection {
                    stream,
                    lease: Lease::new(self, addr, id, Instant::now(), permit),
                })
            }
            Err(source) => {
                self.counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Dial to {} failed: {}", addr, source);
                Err(DialError::Connect { addr, source })
            }
        }
    }

    fn take_idle(&self, addr: SocketAddr) -> Option<IdleConnection> {
        let mut idle = self.idle.lock().ok()?;
        let connections = idle.get_mut(&addr)?;

        while let Some(conn) = connections.pop() {
            if self.is_expired(conn.created_at, conn.idle_since) || !is_clean(&conn.stream) {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding stale pooled connection #{} to {}", conn.id, addr);
                continue;
            }
            return Some(conn);
        }
        None
    }

    fn is_expired(&self, created_at: Instant, idle_since: Instant) -> bool {
        created_at.elapsed() >= self.config.max_lifetime || idle_since.elapsed() >= self.config.idle_timeout
    }

    /// Take a connection back; keeps it idle if it is still worth reusing
    fn release(&self, conn: PooledConnection) {
        let PooledConnection { stream, lease } = conn;

        if !lease.reusable || lease.created_at.elapsed() >= self.config.max_lifetime || !is_clean(&stream) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding connection #{} to {}", lease.id, lease.addr);
            return;
        }

        let Ok(mut idle) = self.idle.lock() else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let connections = idle.entry(lease.addr).or_default();
        if connections.len() >= self.config.max_idle_per_endpoint {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Connection pool full for {}, dropping connection #{}",
                lease.addr, lease.id
            );
            return;
        }

        connections.push(IdleConnection {
            stream,
            id: lease.id,
            created_at: lease.created_at,
            idle_since: Instant::now(),
        });
        self.counters.recycled.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Returned connection #{} to pool for {} (pool size: {})",
            lease.id,
            lease.addr,
            connections.len()
        );
    }

    /// Drop idle connections past their idle timeout or lifetime
    pub fn evict_expired(&self) -> usize {
        let Ok(mut idle) = self.idle.lock() else {
            return 0;
        };

        let mut removed = 0;
        for connections in idle.values_mut() {
            let before = connections.len();
            connections.retain(|conn| !self.is_expired(conn.created_at, conn.idle_since));
            removed += before - connections.len();
        }
        idle.retain(|_, connections| !connections.is_empty());

        if removed > 0 {
            self.counters.discarded.fetch_add(removed, Ordering::Relaxed);
            info!("Connection pool cleanup: removed {} expired connections", removed);
        }
        removed
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dialed: self.counters.dialed.load(Ordering::Relaxed),
            dial_failures: self.counters.dial_failures.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            idle: self.idle_count(),
        }
    }

    /// Periodically evict expired idle connections
    pub fn start_cleanup_task(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.cleanup_interval;
        info!("Started connection pool cleanup task (every {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.evict_expired();
            }
        })
    }
}

/// A connection that is idle must have nothing to read: unexpected data or
/// EOF means the peer has moved on.
fn is_clean(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(_) => false,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    }
}

/// Pool bookkeeping that travels with a borrowed connection
pub struct Lease {
    pool: Arc<ConnectionPool>,
    addr: SocketAddr,
    id: u64,
    created_at: Instant,
    reusable: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    fn new(
        pool: &Arc<ConnectionPool>,
        addr: SocketAddr,
        id: u64,
        created_at: Instant,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            pool: Arc::clone(pool),
            addr,
            id,
            created_at,
            reusable: true,
            _permit: permit,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Mark the connection as tainted so `close` discards it
    pub fn mark_unreusable(&mut self) {
        self.reusable = false;
    }

    /// Rebuild the connection from the halves produced by `into_split`
    pub fn reunite(
        self,
        read: OwnedReadHalf,
        write: OwnedWriteHalf,
    ) -> Result<PooledConnection, ReuniteError> {
        let stream = read.reunite(write)?;
        Ok(PooledConnection { stream, lease: self })
    }
}

/// A connection borrowed from a [`ConnectionPool`]
pub struct PooledConnection {
    stream: TcpStream,
    lease: Lease,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.lease.id
    }

    /// The upstream address this connection was borrowed for
    pub fn addr(&self) -> SocketAddr {
        self.lease.addr
    }

    /// The socket still has a connected peer
    pub fn is_connected(&self) -> bool {
        self.stream.peer_addr().is_ok()
    }

    pub fn is_reusable(&self) -> bool {
        self.lease.reusable
    }

    pub fn mark_unreusable(&mut self) {
        self.lease.mark_unreusable();
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf, Lease) {
        let (read, write) = self.stream.into_split();
        (read, write, self.lease)
    }

    /// Hand the connection back to its pool
    pub fn close(self) {
        let pool = Arc::clone(&self.lease.pool);
        pool.release(self);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.lease.id)
            .field("addr", &self.lease.addr)
            .field("reusable", &self.lease.reusable)
            .finish()
    }
}
