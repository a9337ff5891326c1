//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::endpoint::Endpoint;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub monitoring: MonitoringConfig,
}

/// Listening side of the relay
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub backlog: u32,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Where sessions are relayed to and how the dial is retried
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub addr: Endpoint,
    pub dial_retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub dial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Upstream connection pool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle_per_endpoint: usize,
    /// Zero means no limit
    pub max_active: usize,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

/// Logging and trace output
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Emit a trace line for every relayed chunk
    pub trace_chunks: bool,
    /// Reload the configuration file when it changes
    pub watch_config: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            pool: PoolConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3307)),
            backlog: 128,
            buffer_size: 8192,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: Endpoint::new("127.0.0.1", 3306),
            dial_retry_count: 4,
            dial_backoff: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_endpoint: 8,
            max_active: 0,
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            trace_chunks: true,
            watch_config: false,
        }
    }
}
