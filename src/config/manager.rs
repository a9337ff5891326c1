//! Configuration Manager

use super::Config;
use crate::endpoint::Endpoint;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Values pinned on the command line; they win over the file on every load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub listen: Option<SocketAddr>,
    pub upstream: Option<Endpoint>,
    pub dial_retry_count: Option<u32>,
    pub backlog: Option<u32>,
    pub buffer_size: Option<usize>,
}

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::load_from_str(&content)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate TOML configuration text
    pub fn load_from_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var("DIRECTRELAY_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid DIRECTRELAY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Ok(upstream) = std::env::var("DIRECTRELAY_UPSTREAM_ADDR") {
            config.upstream.addr = upstream
                .parse::<Endpoint>()
                .with_context(|| format!("Invalid DIRECTRELAY_UPSTREAM_ADDR: {}", upstream))?;
        }

        if let Ok(retries) = std::env::var("DIRECTRELAY_DIAL_RETRY_COUNT") {
            config.upstream.dial_retry_count = retries
                .parse::<u32>()
                .with_context(|| format!("Invalid DIRECTRELAY_DIAL_RETRY_COUNT: {}", retries))?;
        }

        if let Ok(timeout) = std::env::var("DIRECTRELAY_CONNECT_TIMEOUT") {
            config.upstream.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid DIRECTRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(backlog) = std::env::var("DIRECTRELAY_BACKLOG") {
            config.server.backlog = backlog
                .parse::<u32>()
                .with_context(|| format!("Invalid DIRECTRELAY_BACKLOG: {}", backlog))?;
        }

        if let Ok(buffer_size) = std::env::var("DIRECTRELAY_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid DIRECTRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(log_level) = std::env::var("DIRECTRELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_upstream_config()
            .with_context(|| "Upstream configuration validation failed")?;

        self.validate_pool_config()
            .with_context(|| "Pool configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.backlog == 0 {
            bail!("backlog must be greater than 0");
        }

        if self.server.buffer_size == 0 {
            bail!("buffer_size must be greater than 0");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_upstream_config(&self) -> Result<()> {
        if self.upstream.addr.port() == 0 {
            bail!("upstream.addr must have a non-zero port");
        }

        if self.upstream.dial_retry_count == 0 {
            bail!("dial_retry_count must be at least 1");
        }

        if self.upstream.dial_retry_count > 100 {
            bail!("dial_retry_count cannot exceed 100");
        }

        if self.upstream.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_pool_config(&self) -> Result<()> {
        if self.pool.idle_timeout.is_zero() {
            bail!("pool.idle_timeout must be greater than 0");
        }

        if self.pool.max_lifetime < self.pool.idle_timeout {
            bail!("pool.max_lifetime must not be shorter than pool.idle_timeout");
        }

        if self.pool.cleanup_interval.is_zero() {
            bail!("pool.cleanup_interval must be greater than 0");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(addr) = overrides.listen {
            self.server.bind_addr = addr;
            tracing::info!("CLI override: listen address set to {}", addr);
        }

        if let Some(endpoint) = &overrides.upstream {
            self.upstream.addr = endpoint.clone();
            tracing::info!("CLI override: upstream set to {}", endpoint);
        }

        if let Some(count) = overrides.dial_retry_count {
            self.upstream.dial_retry_count = count;
            tracing::info!("CLI override: dial retry count set to {}", count);
        }

        if let Some(backlog) = overrides.backlog {
            self.server.backlog = backlog;
            tracing::info!("CLI override: backlog set to {}", backlog);
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }
    }

    /// A reloaded file with the command-line values laid back on top
    pub fn with_cli_overrides(&self, overrides: &CliOverrides) -> Config {
        let mut config = self.clone();
        config.merge_with_cli_args(overrides);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.upstream.dial_retry_count, 4);
    }

    #[test]
    fn test_load_partial_toml() {
        let config = ConfigManager::load_from_str(
            r#"
[server]
bind_addr = "127.0.0.1:7000"
buffer_size = 4096

[upstream]
addr = "db.internal:5432"
dial_retry_count = 2
dial_backoff = "50ms"

[pool]
max_active = 16
idle_timeout = "30s"
"#,
        )
        .unwrap();

        assert_eq!(config.server.bind_addr.port(), 7000);
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.upstream.addr, Endpoint::new("db.internal", 5432));
        assert_eq!(config.upstream.dial_retry_count, 2);
        assert_eq!(config.upstream.dial_backoff, Duration::from_millis(50));
        assert_eq!(config.pool.max_active, 16);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ConfigManager::load_from_str("[upstream]\ndial_retry_count = 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("dial_retry_count"));

        let err = ConfigManager::load_from_str("[server]\nbuffer_size = 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("buffer_size"));

        let err = ConfigManager::load_from_str("[monitoring]\nlog_level = \"loud\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("log_level"));

        assert!(ConfigManager::load_from_str("[upstream]\naddr = \"nohost\"\n").is_err());
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("directrelay.toml");

        let missing = ConfigManager::load_from_file(&path).unwrap();
        assert_eq!(missing.server.bind_addr, Config::default().server.bind_addr);

        std::fs::write(&path, "[upstream]\naddr = \"10.1.2.3:6379\"\n").unwrap();
        let loaded = ConfigManager::load_from_file(&path).unwrap();
        assert_eq!(loaded.upstream.addr.to_string(), "10.1.2.3:6379");
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        let upstream: Endpoint = "cache:11211".parse().unwrap();
        config.merge_with_cli_args(&CliOverrides {
            listen: Some("127.0.0.1:9999".parse().unwrap()),
            upstream: Some(upstream.clone()),
            dial_retry_count: Some(7),
            backlog: None,
            buffer_size: Some(1024),
        });

        assert_eq!(config.server.bind_addr.port(), 9999);
        assert_eq!(config.upstream.addr, upstream);
        assert_eq!(config.upstream.dial_retry_count, 7);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.buffer_size, 1024);
    }

    #[test]
    fn test_reloaded_file_keeps_cli_pins() {
        let reloaded = ConfigManager::load_from_str(
            "[upstream]\naddr = \"b.internal:2\"\ndial_retry_count = 9\n",
        )
        .unwrap();
        let overrides = CliOverrides {
            upstream: Some(Endpoint::new("a.internal", 1)),
            ..CliOverrides::default()
        };

        let effective = reloaded.with_cli_overrides(&overrides);
        assert_eq!(effective.upstream.addr, Endpoint::new("a.internal", 1));
        // Not pinned on the command line, so the file value applies.
        assert_eq!(effective.upstream.dial_retry_count, 9);
        assert_eq!(reloaded.upstream.addr, Endpoint::new("b.internal", 2));

        let none = reloaded.with_cli_overrides(&CliOverrides::default());
        assert_eq!(none.upstream.addr, Endpoint::new("b.internal", 2));
    }
}
