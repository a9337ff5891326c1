//! Direct Relay Server
//!
//! Owns the listening socket, the accept loop and the registry of active
//! sessions. Every accepted client is paired with a pooled upstream
//! connection dialed under the server's retry policy.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::{ClientSession, SessionInfo, SessionOptions};
use crate::config::Config;
use crate::error::RelayError;
use crate::pool::ConnectionPool;
use crate::retry::RetryPolicy;
use crate::trace::{TraceEvent, Tracer};

/// Settings fixed when the server starts
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub backlog: u32,
    pub dial_retry_count: u32,
    pub dial_backoff: Duration,
    pub buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub trace_chunks: bool,
}

impl RelaySettings {
    pub fn new(listen_addr: SocketAddr, upstream_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            upstream_addr,
            backlog: 128,
            dial_retry_count: 4,
            dial_backoff: Duration::ZERO,
            buffer_size: 8192,
            shutdown_timeout: Duration::from_secs(30),
            trace_chunks: true,
        }
    }

    /// Settings from configuration; the upstream must already be resolved
    pub fn from_config(config: &Config, upstream_addr: SocketAddr) -> Self {
        Self {
            listen_addr: config.server.bind_addr,
            upstream_addr,
            backlog: config.server.backlog,
            dial_retry_count: config.upstream.dial_retry_count,
            dial_backoff: config.upstream.dial_backoff,
            buffer_size: config.server.buffer_size,
            shutdown_timeout: config.server.shutdown_timeout,
            trace_chunks: config.monitoring.trace_chunks,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the server handle, the accept loop and sessions
pub(crate) struct ServerShared {
    listen_addr: SocketAddr,
    upstream_addr: RwLock<SocketAddr>,
    dial_retry_count: AtomicU32,
    dial_backoff: Duration,
    session_options: SessionOptions,
    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    pool: Arc<ConnectionPool>,
    tracer: Arc<dyn Tracer>,
}

impl ServerShared {
    fn upstream_addr(&self) -> SocketAddr {
        *self
            .upstream_addr
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dial_retry_count(&self) -> u32 {
        self.dial_retry_count.load(Ordering::Relaxed)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!("Starting connection acceptance loop on {}", self.listen_addr);

        while !self.closed.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        debug!("Accepted connection from {}", client_addr);
                        tokio::spawn(Arc::clone(&self).handle_client(stream, client_addr));
                    }
                    Err(e) => {
                        // Continue accepting connections even if one fails
                        error!("Error accepting connection: {}", e);
                    }
                },
            }
        }

        drop(listener);
        info!("Connection acceptance loop stopped");
    }

    async fn handle_client(self: Arc<Self>, inbound: TcpStream, client_addr: SocketAddr) {
        let upstream_addr = self.upstream_addr();
        let policy = RetryPolicy::new(self.dial_retry_count()).with_backoff(self.dial_backoff);

        let dial = policy.retry(|attempt| {
            let pool = Arc::clone(&self.pool);
            async move {
                debug!(
                    "Dialing upstream {} for {} (attempt {})",
                    upstream_addr, client_addr, attempt
                );
                pool.borrow(upstream_addr).await
            }
        });

        let outbound = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!("Server closing, dropping client {} before upstream was dialed", client_addr);
                return;
            }
            dialed = dial => match dialed {
                Ok(conn) => conn,
                Err(source) => {
                    let reason = source.to_string();
                    let err = RelayError::Dial {
                        addr: upstream_addr,
                        attempts: policy.max_attempts(),
                        source,
                    };
                    warn!("{}; closing client {}", err, client_addr);
                    self.tracer.trace(&TraceEvent::DialFailed {
                        client_addr,
                        upstream_addr,
                        attempts: policy.max_attempts(),
                        reason,
                    });
                    drop(inbound);
                    return;
                }
            },
        };

        let session = ClientSession::new(
            inbound,
            client_addr,
            outbound,
            self.session_options,
            Arc::downgrade(&self),
            Arc::clone(&self.tracer),
        );

        if !self.register(&session) {
            debug!("Server closed while dialing, closing session {}", session.id());
            session.close();
            return;
        }
        session.start();
    }

    fn register(&self, session: &Arc<ClientSession>) -> bool {
        let mut sessions = lock(&self.sessions);
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        sessions.insert(session.id().to_string(), Arc::clone(session));
        true
    }

    pub(crate) fn unregister(&self, session_id: &str) {
        if lock(&self.sessions).remove(session_id).is_some() {
            debug!("Removed session {} from active tracking", session_id);
        }
    }

    fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        lock(&self.sessions).values().cloned().collect()
    }
}

/// TCP relay forwarding every accepted client to one upstream endpoint
pub struct DirectRelayServer {
    shared: Arc<ServerShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl DirectRelayServer {
    /// Bind the listening socket and start accepting in the background
    pub async fn start(
        settings: RelaySettings,
        pool: Arc<ConnectionPool>,
        tracer: Arc<dyn Tracer>,
    ) -> Result<Self, RelayError> {
        let bind_error = |source| RelayError::Bind {
            addr: settings.listen_addr,
            source,
        };
        let listener = bind_listener(settings.listen_addr, settings.backlog).map_err(bind_error)?;
        let listen_addr = listener.local_addr().map_err(bind_error)?;

        info!(
            "Listening on {} (backlog {}), relaying to {}",
            listen_addr, settings.backlog, settings.upstream_addr
        );

        let shared = Arc::new(ServerShared {
            listen_addr,
            upstream_addr: RwLock::new(settings.upstream_addr),
            dial_retry_count: AtomicU32::new(settings.dial_retry_count.max(1)),
            dial_backoff: settings.dial_backoff,
            session_options: SessionOptions {
                buffer_size: settings.buffer_size,
                trace_chunks: settings.trace_chunks,
            },
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            pool,
            tracer,
        });

        shared.tracer.trace(&TraceEvent::ServerStarted {
            listen_addr,
            upstream_addr: settings.upstream_addr,
        });

        let accept_task = tokio::spawn(Arc::clone(&shared).accept_loop(listener));

        Ok(Self {
            shared,
            accept_task: Mutex::new(Some(accept_task)),
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    /// The bound listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.listen_addr
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.shared.upstream_addr()
    }

    /// Point new sessions at a different upstream; live sessions keep theirs
    pub fn set_upstream_addr(&self, addr: SocketAddr) {
        let mut upstream = self
            .shared
            .upstream_addr
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *upstream != addr {
            info!("Upstream changed from {} to {}", *upstream, addr);
            *upstream = addr;
        }
    }

    pub fn dial_retry_count(&self) -> u32 {
        self.shared.dial_retry_count()
    }

    /// Zero is raised to one attempt
    pub fn set_dial_retry_count(&self, count: u32) {
        self.shared.dial_retry_count.store(count.max(1), Ordering::Relaxed);
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.shared.pool
    }

    pub fn session_count(&self) -> usize {
        lock(&self.shared.sessions).len()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<ClientSession>> {
        lock(&self.shared.sessions).get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.snapshot().iter().map(|s| s.info()).collect()
    }

    /// True once closed or once the accept loop has ended
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
            || lock(&self.accept_task)
                .as_ref()
                .map_or(true, JoinHandle::is_finished)
    }

    /// Stop accepting, close every session and wait for their sockets.
    ///
    /// Only the first call does any work.
    pub async fn close(&self) {
        if !self.begin_close() {
            return;
        }

        let accept_task = lock(&self.accept_task).take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Accept loop task failed: {}", e);
                }
            }
        }

        let sessions = self.close_sessions();
        for session in sessions {
            if timeout(self.shutdown_timeout, session.wait_released()).await.is_err() {
                warn!(
                    "Session {} did not release its sockets within {:?}",
                    session.id(),
                    self.shutdown_timeout
                );
            }
        }

        self.shared.tracer.trace(&TraceEvent::ServerClosed {
            listen_addr: self.shared.listen_addr,
        });
        info!("Relay server on {} closed", self.shared.listen_addr);
    }

    fn begin_close(&self) -> bool {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        info!("Closing relay server on {}", self.shared.listen_addr);
        self.shared.shutdown.cancel();
        true
    }

    fn close_sessions(&self) -> Vec<Arc<ClientSession>> {
        let sessions = self.shared.snapshot();
        info!("Closing {} active sessions", sessions.len());
        for session in &sessions {
            session.close();
        }
        lock(&self.shared.sessions).clear();
        sessions
    }
}

impl Drop for DirectRelayServer {
    fn drop(&mut self) {
        if self.begin_close() {
            self.close_sessions();
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::TcpConnector;
    use crate::trace::NoopTracer;

    fn pool() -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            Arc::new(TcpConnector::new(Duration::from_secs(1))),
            PoolConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let settings = RelaySettings::new(addr, "127.0.0.1:9".parse().unwrap());
        match DirectRelayServer::start(settings, pool(), Arc::new(NoopTracer)).await {
            Err(RelayError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            Err(e) => panic!("expected bind error, got {}", e),
            Ok(_) => panic!("bind should fail while the port is taken"),
        }
    }

    #[tokio::test]
    async fn test_retry_count_and_upstream_are_mutable() {
        let settings = RelaySettings::new("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap());
        let server = DirectRelayServer::start(settings, pool(), Arc::new(NoopTracer))
            .await
            .unwrap();

        assert_eq!(server.dial_retry_count(), 4);
        server.set_dial_retry_count(0);
        assert_eq!(server.dial_retry_count(), 1);

        let next: SocketAddr = "127.0.0.1:10".parse().unwrap();
        server.set_upstream_addr(next);
        assert_eq!(server.upstream_addr(), next);

        assert!(!server.is_closed());
        server.close().await;
        assert!(server.is_closed());
        server.close().await;
    }
}
