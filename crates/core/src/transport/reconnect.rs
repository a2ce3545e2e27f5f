//! Connection establishment with exponential backoff
//!
//! Serial adapters take a moment to enumerate after a USB attach and LAN
//! terminals may still be booting, so the first connect is retried.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use super::ByteTransport;
use crate::{EcrError, Result};

/// Reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum backoff time between attempts
    pub max_backoff_ms: u64,
    /// Initial backoff time
    pub initial_backoff_ms: u64,
    /// Maximum number of connection attempts (None = infinite)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_backoff_ms: 8_000,
            initial_backoff_ms: 500,
            max_attempts: Some(5),
        }
    }
}

/// Connect `transport`, retrying with exponential backoff
///
/// # Behavior
/// 1. Try to connect immediately
/// 2. On failure, wait with exponential backoff (0.5s, 1s, 2s, ..., max 8s)
/// 3. Retry up to max_attempts (or forever if None)
pub async fn connect_with_backoff<T>(transport: &mut T, config: &ReconnectConfig) -> Result<()>
where
    T: ByteTransport + ?Sized,
{
    let max_backoff = Duration::from_millis(config.max_backoff_ms);
    let mut backoff = Duration::from_millis(config.initial_backoff_ms);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match transport.connect().await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!("Connected to {} after {} attempts", transport.describe(), attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if let Some(max) = config.max_attempts {
                    if attempt >= max {
                        tracing::error!("Max connection attempts ({}) reached", max);
                        return Err(EcrError::Connection(format!(
                            "Max connection attempts ({}) to {} reached. Last error: {}",
                            max,
                            transport.describe(),
                            e
                        )));
                    }
                }

                tracing::warn!(
                    "Connect attempt {} to {} failed: {}, retrying in {:?}",
                    attempt,
                    transport.describe(),
                    e,
                    backoff
                );

                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, max_backoff);
            }
        }
    }
}
