//! Configuration for minirep components

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Coordinator tunables.
///
/// All intervals are in milliseconds so the struct stays flat for TOML and
/// JSON; `Duration` accessors are provided for call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Interval between quorum re-check passes over active requests
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Base distributed timeout for a replicated request; per-task timeouts
    /// scale from this with batch size
    #[serde(default = "default_base_timeout")]
    pub base_timeout_ms: u64,

    /// Bounded wait for in-flight work when closing a coordinator
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Base delay before a lock-contended transaction is retried
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_poll_interval() -> u64 {
    1000
}
fn default_base_timeout() -> u64 {
    2000
}
fn default_drain_timeout() -> u64 {
    5000
}
fn default_retry_delay() -> u64 {
    100
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            base_timeout_ms: default_base_timeout(),
            drain_timeout_ms: default_drain_timeout(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a TOML file, falling back to defaults for missing fields.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Delay before the nth retry of a lock-contended task, with jitter so
    /// competing replicas do not re-collide in lockstep.
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let base = self.retry_delay_ms.saturating_mul(retry_count.max(1) as u64);
        let jitter = rand::random::<u64>() % (base / 2 + 1);
        Duration::from_millis(base + jitter)
    }
}
