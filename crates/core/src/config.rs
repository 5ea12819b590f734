//! Immutable configuration snapshot consumed by the streaming core.
//!
//! The gateway loads one snapshot at startup (and on reload builds a fresh
//! one); workers keep the snapshot they were built with, the pool hands the
//! newest one to subsequent acquires.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Cluster identifier used in worker keys and broker stream names.
    pub cluster: String,
    pub listen: String,
    /// Bind address for the Prometheus exporter; `None` disables it.
    pub metrics_addr: Option<String>,
    /// Namespace allow-list; empty means all namespaces.
    pub namespaces: Vec<String>,
    pub default_tail: i64,
    pub max_tail: i64,
    pub max_line_bytes: usize,
    pub worker_buffer_lines: usize,
    pub worker_buffer_max_bytes: usize,
    pub subscriber_buffer_lines: usize,
    pub idle_ttl_secs: u64,
    pub terminated_log_ttl_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub app_resync_secs: u64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    /// Shared-broker mode; `None` runs single-replica with in-memory rings.
    pub broker: Option<BrokerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: "local".into(),
            listen: "0.0.0.0:8080".into(),
            metrics_addr: None,
            namespaces: Vec::new(),
            default_tail: 100,
            max_tail: 5000,
            max_line_bytes: 16 * 1024,
            worker_buffer_lines: 2048,
            worker_buffer_max_bytes: 4 * 1024 * 1024,
            subscriber_buffer_lines: 256,
            idle_ttl_secs: 60,
            terminated_log_ttl_secs: 30,
            retry_attempts: 5,
            retry_base_delay_ms: 200,
            app_resync_secs: 10,
            rate_limit_per_minute: 30,
            rate_limit_burst: 10,
            broker: None,
        }
    }
}

impl Config {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn terminated_log_ttl(&self) -> Duration {
        Duration::from_secs(self.terminated_log_ttl_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn app_resync(&self) -> Duration {
        Duration::from_secs(self.app_resync_secs)
    }

    /// Resolve a client tail request against the configured bounds.
    /// Out-of-range values clamp silently.
    pub fn clamp_tail(&self, requested: Option<i64>) -> i64 {
        requested.unwrap_or(self.default_tail).clamp(0, self.max_tail)
    }

    pub fn namespace_allowed(&self, ns: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|n| n == ns)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub url: String,
    /// Prefix for stream and lock keys.
    pub prefix: String,
    /// `XADD ... MAXLEN ~` trim target per worker stream.
    pub stream_max_len: usize,
    pub lock_ttl_secs: u64,
    /// `XREAD BLOCK` timeout for follower reads.
    pub block_millis: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".into(),
            prefix: "tailgate".into(),
            stream_max_len: 4096,
            lock_ttl_secs: 15,
            block_millis: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Renewal cadence for the per-key writer lock.
    pub fn lock_renew_interval(&self) -> Duration {
        Duration::from_secs((self.lock_ttl_secs / 3).max(1))
    }
}
