//! DirectRelay - Transparent TCP relay
//!
//! Accepts TCP clients and forwards each one, byte for byte, to a single
//! upstream endpoint over a pooled connection.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use directrelay::{
    config::{CliOverrides, ConfigManager, ConfigWatcher},
    probe::PingClient,
    shutdown::ShutdownAwareTask,
    ConnectionPool, DirectRelayServer, Endpoint, LogTracer, RelaySettings, ShutdownCoordinator, TcpConnector,
};

/// CLI arguments for DirectRelay
#[derive(Parser, Debug)]
#[command(name = "directrelay")]
#[command(about = "DirectRelay - Transparent TCP relay")]
#[command(version)]
#[command(long_about = "
DirectRelay - Transparent TCP relay

Every accepted client is paired with a connection to the upstream endpoint and
bytes are copied in both directions until either side closes.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  DIRECTRELAY_BIND_ADDR          - Listen address (e.g., 0.0.0.0:3307)
  DIRECTRELAY_UPSTREAM_ADDR      - Upstream host:port
  DIRECTRELAY_DIAL_RETRY_COUNT   - Upstream dial attempts per client
  DIRECTRELAY_CONNECT_TIMEOUT    - Upstream connect timeout (e.g., 10s)
  DIRECTRELAY_BACKLOG            - Listen backlog
  DIRECTRELAY_BUFFER_SIZE        - Relay buffer size in bytes
  DIRECTRELAY_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "directrelay.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    #[arg(short, long, help = "Listen address (e.g., 0.0.0.0:3307)")]
    pub listen: Option<SocketAddr>,

    #[arg(short, long, help = "Upstream endpoint as host:port")]
    pub upstream: Option<Endpoint>,

    #[arg(long, help = "Upstream dial attempts per client")]
    pub dial_retry_count: Option<u32>,

    #[arg(long, help = "Listen backlog")]
    pub backlog: Option<u32>,

    #[arg(long, help = "Relay buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level, defaults to the configured one")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[arg(long, help = "Ping the upstream before accepting clients")]
    pub probe: bool,

    #[arg(long, help = "Reload upstream settings when the config file changes")]
    pub watch_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    init_tracing(&args, &config.monitoring.log_level)?;
    info!("Starting DirectRelay v{}", env!("CARGO_PKG_VERSION"));

    let overrides = CliOverrides {
        listen: args.listen,
        upstream: args.upstream.clone(),
        dial_retry_count: args.dial_retry_count,
        backlog: args.backlog,
        buffer_size: args.buffer_size,
    };
    config.merge_with_cli_args(&overrides);

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen address: {}", config.server.bind_addr);
        info!("  Upstream: {}", config.upstream.addr);
        info!("  Dial retry count: {}", config.upstream.dial_retry_count);
        info!("  Backlog: {}", config.server.backlog);
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        info!(
            "  Pool: {} idle per endpoint, {} active max",
            config.pool.max_idle_per_endpoint,
            if config.pool.max_active == 0 {
                "unlimited".to_string()
            } else {
                config.pool.max_active.to_string()
            }
        );
        return Ok(());
    }

    let upstream_addr = config
        .upstream
        .addr
        .resolve()
        .await
        .with_context(|| format!("Failed to resolve upstream {}", config.upstream.addr))?;

    if args.probe {
        let ping = PingClient::new(config.upstream.connect_timeout)
            .ping(upstream_addr, 4)
            .await;
        if ping.loss_count() == ping.samples().len() {
            warn!("Upstream {} did not answer any probe", upstream_addr);
        } else {
            info!(
                "Upstream {} reachable: avg {:?}, {} of {} probes lost",
                upstream_addr,
                ping.avg(),
                ping.loss_count(),
                ping.samples().len()
            );
        }
    }

    let connector = TcpConnector::new(config.upstream.connect_timeout);
    let pool = Arc::new(ConnectionPool::new(Arc::new(connector), config.pool.clone()));
    let cleanup_task = Arc::clone(&pool).start_cleanup_task();

    let settings = RelaySettings::from_config(&config, upstream_addr);
    let tracer = LogTracer::with_prefix(format!(
        "DirectRelay[{} to {}] ",
        config.server.bind_addr, upstream_addr
    ));
    let server = Arc::new(
        DirectRelayServer::start(settings, pool, Arc::new(tracer))
            .await
            .context("Failed to start relay server")?,
    );

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);

    let watch_task = if args.watch_config || config.monitoring.watch_config {
        let watcher = ConfigWatcher::new(args.config.clone())?;
        let server = Arc::clone(&server);
        let task = ShutdownAwareTask::spawn(&shutdown_coordinator, "config-watcher", async move {
            let mut changes = watcher.subscribe();
            while let Some(change) = changes.next().await {
                let event = match change {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Missed configuration change: {}", e);
                        continue;
                    }
                };
                let config = event.config.with_cli_overrides(&overrides);
                match config.upstream.addr.resolve().await {
                    Ok(addr) => server.set_upstream_addr(addr),
                    Err(e) => error!("Keeping current upstream: {:#}", e),
                }
                server.set_dial_retry_count(config.upstream.dial_retry_count);
            }
        });
        Some(tokio::spawn(task.wait_for_completion_or_shutdown()))
    } else {
        None
    };

    info!(
        "DirectRelay listening on {}, relaying to {}",
        server.local_addr(),
        server.upstream_addr()
    );
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    info!("Initiating graceful shutdown...");
    if let Err(e) = shutdown_coordinator.shutdown_server(&server).await {
        warn!("{}", e);
    }

    if let Some(handle) = watch_task {
        if let Err(e) = handle.await {
            error!("Config watcher task failed: {}", e);
        }
    }
    cleanup_task.abort();

    let stats = server.pool().stats();
    info!(
        dialed = stats.dialed,
        reused = stats.reused,
        recycled = stats.recycled,
        discarded = stats.discarded,
        "Server shutdown complete"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(configured_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
