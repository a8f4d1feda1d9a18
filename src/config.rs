//! Engine settings.
//!
//! Operational knobs for the engine: key-length guard, circuit-breaker
//! retry interval, per-call storage timeout, config cache staleness,
//! warning dedup window, and the maintenance task interval. Loadable
//! from a YAML file with serde defaults for every field.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rules::RateLimitConfig;

/// Operational settings for the rate limit engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Keys longer than this fail open without touching the counter.
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    /// How long the resilient store waits before re-probing a failed
    /// primary backend.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Per-call timeout for storage operations. A timeout counts as a
    /// backend failure for failover purposes.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Maximum age of the cached per-module config map before a refresh.
    #[serde(default = "default_config_staleness_ms")]
    pub config_staleness_ms: u64,

    /// Window within which repeated warning events for the same
    /// `module:key` are deduplicated.
    #[serde(default = "default_warning_dedup_ms")]
    pub warning_dedup_ms: u64,

    /// Interval between background block re-sync and state cleanup runs.
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Secret for HMAC identity hashing. When unset, a clearly-marked
    /// development fallback is used and warned about once.
    #[serde(default)]
    pub identity_secret: Option<String>,

    /// Built-in per-module defaults used when no config row exists.
    #[serde(default)]
    pub module_defaults: HashMap<String, RateLimitConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_key_length: default_max_key_length(),
            retry_interval_ms: default_retry_interval_ms(),
            op_timeout_ms: default_op_timeout_ms(),
            config_staleness_ms: default_config_staleness_ms(),
            warning_dedup_ms: default_warning_dedup_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            identity_secret: None,
            module_defaults: HashMap::new(),
        }
    }
}

fn default_max_key_length() -> usize {
    512
}

fn default_retry_interval_ms() -> u64 {
    60_000
}

fn default_op_timeout_ms() -> u64 {
    2_000
}

fn default_config_staleness_ms() -> u64 {
    5_000
}

fn default_warning_dedup_ms() -> u64 {
    60_000
}

fn default_maintenance_interval_ms() -> u64 {
    300_000
}

impl EngineSettings {
    /// Load settings from a YAML file.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::FloodgateError::ConfigLoad(e.to_string()))
    }

    /// Circuit-breaker retry interval as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Per-call storage timeout as a [`Duration`].
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Config cache staleness as a [`Duration`].
    pub fn config_staleness(&self) -> Duration {
        Duration::from_millis(self.config_staleness_ms)
    }

    /// Warning dedup window as a [`Duration`].
    pub fn warning_dedup(&self) -> Duration {
        Duration::from_millis(self.warning_dedup_ms)
    }

    /// Maintenance task interval as a [`Duration`].
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}
