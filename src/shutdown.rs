//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM or SIGINT, fans the signal out to background tasks and
//! closes the relay server within a bounded time.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::relay::DirectRelayServer;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx, timeout }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Notify every subscriber that shutdown has begun
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("No tasks subscribed to the shutdown signal");
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Close the relay server, giving up after the shutdown timeout.
    ///
    /// Returns an error if sessions were still releasing their sockets when
    /// the timeout expired.
    pub async fn shutdown_server(&self, server: &DirectRelayServer) -> Result<()> {
        let start_time = Instant::now();
        let sessions = server.session_count();
        info!(
            "Closing relay server with {} active sessions (timeout: {:?})",
            sessions, self.timeout
        );

        match tokio::time::timeout(self.timeout, server.close()).await {
            Ok(()) => {
                info!("Relay server closed in {:?}", start_time.elapsed());
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Shutdown timeout reached after {:?} with {} sessions still registered",
                    start_time.elapsed(),
                    server.session_count()
                );
                Err(anyhow::anyhow!("Shutdown did not complete within {:?}", self.timeout))
            }
        }
    }
}

/// Background task that is aborted when shutdown begins
pub struct ShutdownAwareTask {
    name: String,
    handle: tokio::task::JoinHandle<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownAwareTask {
    pub fn spawn<Fut>(shutdown_coordinator: &ShutdownCoordinator, task_name: &str, task: Fut) -> Self
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = task_name.to_string();
        let task_label = name.clone();
        let handle = tokio::spawn(async move {
            debug!("Starting shutdown-aware task: {}", task_label);
            task.await;
            debug!("Shutdown-aware task completed: {}", task_label);
        });

        Self {
            name,
            handle,
            shutdown_rx: shutdown_coordinator.subscribe(),
        }
    }

    /// Run until the task finishes on its own or shutdown aborts it
    pub async fn wait_for_completion_or_shutdown(mut self) -> Result<()> {
        tokio::select! {
            result = &mut self.handle => match result {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => {
                    error!("Task {} failed: {}", self.name, e);
                    Err(anyhow::anyhow!("Task {} failed: {}", self.name, e))
                }
            },
            _ = self.shutdown_rx.recv() => {
                debug!("Shutdown signal received, aborting task {}", self.name);
                self.handle.abort();
                Ok(())
            }
        }
    }
}
