//! Per-module rate limit configuration and its resolution.
//!
//! A config must be resolvable for *any* module: first from durable
//! storage, then from a built-in per-module default, and finally from the
//! fallback template. Callers never see "no config". The fallback template
//! is inactive and monitor-only, so an unconfigured module is safe by
//! default rather than absent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::DurableStore;

/// How a module's limit is applied once exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Record events for visibility, never deny a request.
    Monitor,
    /// Deny requests over the limit and persist blocks.
    Enforce,
}

impl LimitMode {
    /// Stable string form used in storage columns and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitMode::Monitor => "monitor",
            LimitMode::Enforce => "enforce",
        }
    }

    /// Parse from the stored string form, defaulting to enforce.
    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "monitor" => LimitMode::Monitor,
            _ => LimitMode::Enforce,
        }
    }
}

/// Rate limit configuration for one module.
///
/// A value object, not an entity: it is cheap to clone and carries no
/// identity beyond the module name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Module this config applies to.
    #[serde(default)]
    pub module: String,
    /// Maximum requests allowed per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: i64,
    /// Block duration in milliseconds. Defaults to the window length.
    #[serde(default)]
    pub block_ms: Option<i64>,
    /// Warn when remaining requests drop to this value. 0 disables warnings.
    #[serde(default)]
    pub warn_threshold: u32,
    /// Inactive configs never consume or block; checks always pass.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Monitor or enforce.
    #[serde(default = "default_mode")]
    pub mode: LimitMode,
    /// Whether the raw email may be forwarded to the event path.
    #[serde(default)]
    pub store_email_in_events: bool,
    /// Whether the raw IP may be forwarded to the event path.
    #[serde(default)]
    pub store_ip_in_events: bool,
    /// True only for the built-in safety-net template.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_fallback: bool,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> LimitMode {
    LimitMode::Enforce
}

impl RateLimitConfig {
    /// Effective block duration: `block_ms` when set, else the window length.
    pub fn block_duration_ms(&self) -> i64 {
        self.block_ms.unwrap_or(self.window_ms)
    }

    /// Whether warning events are enabled for this config.
    pub fn warnings_enabled(&self) -> bool {
        self.warn_threshold > 0
    }

    /// The safety-net template returned when no config exists anywhere.
    ///
    /// Inactive and monitor-only, so an unconfigured module never blocks.
    pub fn fallback(module: &str) -> Self {
        Self {
            module: module.to_string(),
            max_requests: 1_000,
            window_ms: 60_000,
            block_ms: None,
            warn_threshold: 0,
            is_active: false,
            mode: LimitMode::Monitor,
            store_email_in_events: false,
            store_ip_in_events: false,
            is_fallback: true,
        }
    }
}

/// Cached per-module config resolution with bounded staleness.
///
/// Refreshes from durable storage at most once per staleness interval,
/// using a single-flight gate: concurrent callers during a refresh await
/// the same in-flight load. On load failure the last-known-good map stays
/// in effect.
pub struct ConfigService {
    durable: Arc<DurableStore>,
    defaults: HashMap<String, RateLimitConfig>,
    cached: RwLock<HashMap<String, RateLimitConfig>>,
    refreshed_at: Mutex<Option<Instant>>,
    refresh_gate: tokio::sync::Mutex<()>,
    staleness: Duration,
}

impl ConfigService {
    /// Create a config service over the durable store.
    ///
    /// `defaults` supplies built-in per-module configs consulted when no
    /// stored row exists for a module.
    pub fn new(
        durable: Arc<DurableStore>,
        defaults: HashMap<String, RateLimitConfig>,
        staleness: Duration,
    ) -> Self {
        // Built-in defaults keyed by module carry the module name even if
        // the map entry omitted it.
        let defaults = defaults
            .into_iter()
            .map(|(module, mut cfg)| {
                if cfg.module.is_empty() {
                    cfg.module = module.clone();
                }
                (module, cfg)
            })
            .collect();

        Self {
            durable,
            defaults,
            cached: RwLock::new(HashMap::new()),
            refreshed_at: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            staleness,
        }
    }

    /// Resolve the config for a module. Always succeeds.
    pub async fn get_config(&self, module: &str) -> RateLimitConfig {
        self.ensure_fresh().await;

        if let Some(cfg) = self.cached.read().get(module) {
            return cfg.clone();
        }
        if let Some(cfg) = self.defaults.get(module) {
            return cfg.clone();
        }
        RateLimitConfig::fallback(module)
    }

    /// Upsert a module config and make it visible immediately.
    pub async fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        self.durable.upsert_config(&config).await?;

        // Invalidate so the next read refreshes without waiting for
        // staleness to expire.
        *self.refreshed_at.lock() = None;
        self.ensure_fresh().await;
        Ok(())
    }

    fn is_fresh(&self) -> bool {
        matches!(*self.refreshed_at.lock(), Some(t) if t.elapsed() < self.staleness)
    }

    async fn ensure_fresh(&self) {
        if self.is_fresh() {
            return;
        }

        // Single flight: late arrivals wait here, then observe the
        // refresh performed by the first caller and return.
        let _gate = self.refresh_gate.lock().await;
        if self.is_fresh() {
            return;
        }

        match self.durable.load_configs().await {
            Ok(configs) => {
                let map: HashMap<String, RateLimitConfig> = configs
                    .into_iter()
                    .map(|cfg| (cfg.module.clone(), cfg))
                    .collect();
                debug!(modules = map.len(), "Refreshed rate limit configs");
                *self.cached.write() = map;
            }
            Err(e) => {
                // Keep serving the last-known-good map; a transient
                // storage outage must not make configs disappear.
                warn!(error = %e, "Config refresh failed, keeping cached configs");
            }
        }

        // Stamp even on failure so a broken store is re-probed at the
        // staleness interval instead of on every call.
        *self.refreshed_at.lock() = Some(Instant::now());
    }
}
