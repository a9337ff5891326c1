//! Endpoint addressing

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::lookup_host;
use tracing::debug;

use anyhow::{anyhow, bail, Context};
use crate::Result;

/// A `host:port` pair as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to the first socket address the host maps to
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.to_string().parse::<SocketAddr>() {
            return Ok(addr);
        }

        debug!("Resolving endpoint: {}", self);
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("DNS resolution failed for {}", self))?;

        addrs
            .next()
            .ok_or_else(|| anyhow!("DNS resolution returned no addresses for {}", self))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Endpoint '{}' must be in host:port form", s))?;
        if host.is_empty() {
            bail!("Endpoint '{}' has an empty host", s);
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Endpoint '{}' has an invalid port", s))?;

        Ok(Self::new(host, port))
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
