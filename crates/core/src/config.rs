//! Engine configuration
//!
//! Every section has defaults, so an empty JSON object is a valid config and
//! a file only needs the values it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::RegistryConfig;
use crate::orchestrator::RetryPolicy;
use crate::session::SessionConfig;
use crate::transport::serial::DEFAULT_BAUD_RATE;
use crate::transport::{ReconnectConfig, SerialTransport, TcpTransport};
use crate::{EcrError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Timeout of a single port read; keep it well below the poll interval
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 5,
        }
    }
}

impl SerialConfig {
    /// Serial transport for `path`; `baud_rate` overrides the configured rate
    pub fn transport(&self, path: impl Into<String>, baud_rate: Option<u32>) -> SerialTransport {
        SerialTransport::new(path, baud_rate.unwrap_or(self.baud_rate))
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
        }
    }
}

impl TcpConfig {
    pub fn transport(&self, address: impl Into<String>) -> TcpTransport {
        TcpTransport::new(address)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EcrConfig {
    pub session: SessionConfig,
    pub retry: RetryPolicy,
    pub registry: RegistryConfig,
    pub serial: SerialConfig,
    pub tcp: TcpConfig,
    pub reconnect: ReconnectConfig,
}

impl EcrConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| EcrError::Config(e.to_string()))
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EcrError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Like [`EcrConfig::load`], but a missing file yields the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
