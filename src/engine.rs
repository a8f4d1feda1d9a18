//! The rate limit engine.
//!
//! Ties the pieces together: config resolution, the manual block
//! registry, the two-tier counter store, and the event recorder. The
//! admission path (`check_limit`) is the one hot call; everything else
//! is administration and maintenance.
//!
//! The engine fails open: when storage cannot answer, a request is
//! allowed and the failure is logged and counted. Denying traffic
//! because the limiter's own backend is down would turn a limiter
//! outage into a site outage.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blocks::{BlockFilter, BlockRegistry, ManualBlockParams, UserBlock};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::error::Result;
use crate::events::{EventInput, EventPage, EventQuery, EventRecorder, EventType};
use crate::identity::IdentityHasher;
use crate::metrics::{MetricsSink, TracingMetrics};
use crate::rules::{ConfigService, RateLimitConfig};
use crate::store::{
    ConsumeOutcome, ConsumeRequest, CounterStore, DurableStore, HealthStatus, MemoryStore,
    RateLimitState, ResilientStore, StateAction, StateFilter, WarningInfo,
};

const DEFAULT_EVENT_PAGE: i64 = 50;

/// Optional identity and behavior flags for one admission check.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// Stable user identifier, if the caller has one.
    pub user_id: Option<String>,
    /// Raw email; hashed before any storage or matching.
    pub email: Option<String>,
    /// Raw IP address; hashed before any storage or matching.
    pub ip: Option<String>,
    /// False peeks at the counter without consuming.
    pub increment: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            user_id: None,
            email: None,
            ip: None,
            increment: true,
        }
    }
}

/// The outcome of an admission check.
#[derive(Debug, Clone)]
pub struct LimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests remaining in the current window.
    pub remaining: u32,
    /// When the current window ends.
    pub reset_at_ms: i64,
    /// Active block expiry, if the request was denied by a block.
    pub blocked_until_ms: Option<i64>,
    /// Warning crossing, if this check triggered one.
    pub warning: Option<WarningInfo>,
}

/// Result of a `manage_limits` run.
#[derive(Debug, Clone)]
pub struct ManagedStates {
    /// The state rows the filter matched.
    pub matched: Vec<RateLimitState>,
    /// Rows changed; zero on a dry run.
    pub affected: u64,
}

/// Orchestrates admission control over the two-tier store.
pub struct RateLimitEngine {
    store: Arc<ResilientStore>,
    configs: Arc<ConfigService>,
    events: Arc<EventRecorder>,
    blocks: Arc<BlockRegistry>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl RateLimitEngine {
    /// Build an engine over the given durable store with the default
    /// system clock and tracing metrics.
    pub async fn new(durable: Arc<DurableStore>, settings: EngineSettings) -> Result<Self> {
        Self::with_parts(
            durable,
            settings,
            Arc::new(TracingMetrics),
            Arc::new(SystemClock),
        )
        .await
    }

    /// Build an engine with injected metrics and clock.
    pub async fn with_parts(
        durable: Arc<DurableStore>,
        settings: EngineSettings,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let hasher = Arc::new(IdentityHasher::new(settings.identity_secret.clone()));

        let store = Arc::new(ResilientStore::new(
            Arc::new(MemoryStore::new()),
            durable.clone(),
            settings.retry_interval(),
            settings.op_timeout(),
            metrics.clone(),
        ));

        let configs = Arc::new(ConfigService::new(
            durable.clone(),
            settings.module_defaults.clone(),
            settings.config_staleness(),
        ));

        let events = Arc::new(
            EventRecorder::new(
                durable.clone(),
                hasher.clone(),
                metrics.clone(),
                settings.warning_dedup(),
            )
            .await,
        );

        let blocks = Arc::new(BlockRegistry::new(
            durable,
            store.clone(),
            hasher,
            metrics.clone(),
        ));

        let engine = Self {
            store,
            configs,
            events,
            blocks,
            metrics,
            clock,
            settings,
        };

        // Warm the fast store's block flags from the database so blocks
        // survive a restart.
        engine.blocks.sync(engine.clock.now_ms()).await?;
        info!("rate limit engine initialized");
        Ok(engine)
    }

    /// Admission check for one request. Never fails: storage trouble
    /// resolves to an allow.
    pub async fn check_limit(
        &self,
        module: &str,
        key: &str,
        options: CheckOptions,
    ) -> LimitDecision {
        let started = Instant::now();
        let now = self.clock.now_ms();
        let config = self.configs.get_config(module).await;

        if key.len() > self.settings.max_key_length {
            warn!(
                module = %module,
                key_length = key.len(),
                "oversized rate limit key, failing open"
            );
            return self.fail_open(module, &config, now, started);
        }

        // Manual blocks outrank everything, including monitor mode and
        // inactive configs: an explicit admin block always denies.
        match self
            .blocks
            .check_active_blocks(
                module,
                key,
                options.user_id.as_deref(),
                options.email.as_deref(),
                options.ip.as_deref(),
                now,
            )
            .await
        {
            Ok(Some(active)) => {
                debug!(module = %module, target = %active.target, "request denied by block");
                self.metrics.check_outcome(module, false);
                self.metrics
                    .operation_latency("check_limit", started.elapsed());
                return LimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at_ms: active.blocked_until.unwrap_or(i64::MAX),
                    blocked_until_ms: active.blocked_until,
                    warning: None,
                };
            }
            Ok(None) => {}
            Err(e) => {
                // Block lookup trouble must not deny legitimate traffic.
                warn!(module = %module, error = %e, "block check failed, continuing");
            }
        }

        if !config.is_active {
            self.metrics.check_outcome(module, true);
            return LimitDecision {
                allowed: true,
                remaining: config.max_requests,
                reset_at_ms: now + config.window_ms,
                blocked_until_ms: None,
                warning: None,
            };
        }

        let request = ConsumeRequest {
            key: key.to_string(),
            module: module.to_string(),
            config: config.clone(),
            increment: options.increment,
            now_ms: now,
        };

        match self.store.consume(&request).await {
            Ok(outcome) => {
                self.record_events(module, key, &config, &options, &outcome, now)
                    .await;
                self.metrics.check_outcome(module, outcome.allowed);
                self.metrics
                    .operation_latency("check_limit", started.elapsed());
                LimitDecision {
                    allowed: outcome.allowed,
                    remaining: outcome.remaining,
                    reset_at_ms: outcome.reset_at_ms,
                    blocked_until_ms: outcome.blocked_until_ms,
                    warning: outcome.warning,
                }
            }
            Err(e) => {
                error!(module = %module, error = %e, "counter store unavailable, failing open");
                self.fail_open(module, &config, now, started)
            }
        }
    }

    fn fail_open(
        &self,
        module: &str,
        config: &RateLimitConfig,
        now: i64,
        started: Instant,
    ) -> LimitDecision {
        self.metrics.check_outcome(module, true);
        self.metrics
            .operation_latency("check_limit", started.elapsed());
        LimitDecision {
            allowed: true,
            remaining: config.max_requests,
            reset_at_ms: now + config.window_ms,
            blocked_until_ms: None,
            warning: None,
        }
    }

    async fn record_events(
        &self,
        module: &str,
        key: &str,
        config: &RateLimitConfig,
        options: &CheckOptions,
        outcome: &ConsumeOutcome,
        now: i64,
    ) {
        let event_type = if outcome.block_triggered {
            EventType::Block
        } else if outcome.warning.is_some() && options.increment {
            EventType::Warning
        } else {
            return;
        };

        // Raw identity reaches the event path only when the module's
        // storage flags permit it; the recorder hashes before writing.
        let input = EventInput {
            module: module.to_string(),
            key: key.to_string(),
            event_type,
            mode: config.mode,
            user_id: options.user_id.clone(),
            email: config
                .store_email_in_events
                .then(|| options.email.clone())
                .flatten(),
            ip: config
                .store_ip_in_events
                .then(|| options.ip.clone())
                .flatten(),
            count: outcome.count as i64,
            max_requests: config.max_requests as i64,
            window_start: outcome.reset_at_ms - config.window_ms,
            window_end: outcome.reset_at_ms,
            blocked_until: outcome.blocked_until_ms,
        };
        self.events.record(input, now).await;
    }

    /// Resolve the effective config for a module.
    pub async fn get_config(&self, module: &str) -> RateLimitConfig {
        self.configs.get_config(module).await
    }

    /// Upsert a module config; visible to checks immediately.
    pub async fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        self.configs.update_config(config).await
    }

    /// Remove counter state for a key and/or module in both tiers, and
    /// deactivate any manual blocks targeting the key.
    pub async fn reset_limits(&self, key: Option<&str>, module: Option<&str>) -> Result<u64> {
        let now = self.clock.now_ms();
        let removed = self.store.reset(key, module).await?;

        // Manual blocks in the same scope go too: a key-scoped reset
        // drops blocks targeting that key, a module-only or full reset
        // drops every active block in the module (or everywhere).
        self.blocks
            .bulk_deactivate(
                &BlockFilter {
                    target: key.map(str::to_string),
                    module: module.map(str::to_string),
                    active_only: true,
                    ..Default::default()
                },
                now,
            )
            .await?;

        info!(key = ?key, module = ?module, removed = removed, "limits reset");
        Ok(removed)
    }

    /// Find counter states matching a filter and optionally apply an
    /// action to them. A dry run returns the matches untouched.
    pub async fn manage_limits(
        &self,
        filter: &StateFilter,
        action: StateAction,
        dry_run: bool,
    ) -> Result<ManagedStates> {
        let now = self.clock.now_ms();
        let matched = self.store.durable().find_states(filter, now, None).await?;
        if dry_run || matched.is_empty() {
            return Ok(ManagedStates {
                matched,
                affected: 0,
            });
        }

        let ids: Vec<String> = matched.iter().map(|s| s.id.clone()).collect();
        let affected = self
            .store
            .durable()
            .apply_state_action(&ids, action, now)
            .await?;

        // The fast tier may hold the same slots; drop them so the edited
        // durable rows win.
        for state in &matched {
            self.store
                .invalidate_primary(Some(&state.key), Some(&state.module))
                .await;
        }

        info!(action = ?action, affected = affected, "managed counter states");
        Ok(ManagedStates { matched, affected })
    }

    /// List counter states matching a filter, newest first.
    pub async fn list_states(
        &self,
        filter: &StateFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RateLimitState>> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .durable()
            .find_states(filter, now, Some((limit, offset)))
            .await?)
    }

    /// Delete one counter state row by id.
    pub async fn clear_state(&self, id: &str) -> Result<bool> {
        let Some(state) = self.store.durable().get_state(id).await? else {
            return Ok(false);
        };
        let deleted = self.store.durable().delete_state(id).await?;
        if deleted {
            self.store
                .invalidate_primary(Some(&state.key), Some(&state.module))
                .await;
        }
        Ok(deleted)
    }

    /// List recorded events with cursor pagination.
    pub async fn list_events(&self, mut query: EventQuery) -> Result<EventPage> {
        if query.limit <= 0 {
            query.limit = DEFAULT_EVENT_PAGE;
        }
        Ok(self.store.durable().list_events(&query).await?)
    }

    /// Create a manual block.
    pub async fn create_block(&self, params: ManualBlockParams) -> Result<UserBlock> {
        self.blocks
            .create_manual_block(params, self.clock.now_ms())
            .await
    }

    /// Deactivate a manual block by id.
    pub async fn remove_block(&self, id: &str) -> Result<bool> {
        self.blocks.deactivate(id, self.clock.now_ms()).await
    }

    /// List blocks matching a filter.
    pub async fn list_blocks(&self, filter: &BlockFilter) -> Result<Vec<UserBlock>> {
        self.blocks.list(filter, self.clock.now_ms()).await
    }

    /// Deactivate every block matching a filter.
    pub async fn bulk_remove_blocks(&self, filter: &BlockFilter) -> Result<u64> {
        self.blocks.bulk_deactivate(filter, self.clock.now_ms()).await
    }

    /// Deactivate blocks whose expiry has passed. Also run periodically
    /// by the maintenance task.
    pub async fn cleanup_blocks(&self) -> Result<u64> {
        self.blocks.cleanup(self.clock.now_ms()).await
    }

    /// Probe both storage tiers.
    pub async fn health(&self) -> HealthStatus {
        self.store.health().await
    }

    /// Drain and close both storage tiers.
    pub async fn shutdown(&self) -> Result<()> {
        self.store.shutdown().await?;
        Ok(())
    }

    /// Spawn the periodic maintenance task: block re-sync, expired
    /// state cleanup, and expired block deactivation. Failures are
    /// logged and the loop continues.
    pub fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        let engine = self;
        let period = engine.settings.maintenance_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, the constructor
            // already synced.
            interval.tick().await;
            loop {
                interval.tick().await;
                engine.run_maintenance().await;
            }
        })
    }

    /// One maintenance pass. Public so hosts can run it on their own
    /// schedule instead of [`spawn_maintenance`].
    pub async fn run_maintenance(&self) {
        let now = self.clock.now_ms();
        if let Err(e) = self.blocks.sync(now).await {
            warn!(error = %e, "maintenance: block sync failed");
        }
        match self.store.durable().cleanup_expired_states(now).await {
            Ok(removed) if removed > 0 => {
                debug!(removed = removed, "maintenance: expired states removed")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "maintenance: state cleanup failed"),
        }
        if let Err(e) = self.blocks.cleanup(now).await {
            warn!(error = %e, "maintenance: block cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::NoopMetrics;
    use crate::rules::LimitMode;
    use std::collections::HashMap;

    fn config(module: &str, max: u32, mode: LimitMode) -> RateLimitConfig {
        RateLimitConfig {
            module: module.to_string(),
            max_requests: max,
            window_ms: 60_000,
            block_ms: None,
            warn_threshold: 0,
            is_active: true,
            mode,
            store_email_in_events: false,
            store_ip_in_events: false,
            is_fallback: false,
        }
    }

    /// Opt-in log output for debugging: `RUST_LOG=debug cargo test`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn engine_with(
        defaults: Vec<RateLimitConfig>,
    ) -> (Arc<ManualClock>, Arc<DurableStore>, RateLimitEngine) {
        init_tracing();
        let clock = ManualClock::new(1_000_000);
        let durable = Arc::new(DurableStore::in_memory().await.unwrap());
        let settings = EngineSettings {
            identity_secret: Some("test-secret".to_string()),
            module_defaults: defaults
                .into_iter()
                .map(|c| (c.module.clone(), c))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        let engine = RateLimitEngine::with_parts(
            durable.clone(),
            settings,
            Arc::new(NoopMetrics),
            clock.clone(),
        )
        .await
        .unwrap();
        (clock, durable, engine)
    }

    #[tokio::test]
    async fn test_limit_sequence_blocks_and_recovers() {
        let (clock, durable, engine) =
            engine_with(vec![config("login", 3, LimitMode::Enforce)]).await;

        for expected in [2u32, 1, 0] {
            let decision = engine
                .check_limit("login", "u1", CheckOptions::default())
                .await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = engine
            .check_limit("login", "u1", CheckOptions::default())
            .await;
        assert!(!denied.allowed);
        assert_eq!(denied.blocked_until_ms, Some(clock.now_ms() + 60_000));

        // Exactly one block event for the crossing, despite retries.
        engine
            .check_limit("login", "u1", CheckOptions::default())
            .await;
        let events = durable
            .list_events(&EventQuery {
                event_type: Some(EventType::Block),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.events.len(), 1);
        assert_eq!(events.events[0].key, "u1");

        // After the block expires the key counts fresh.
        clock.advance(61_000 + 60_000);
        let decision = engine
            .check_limit("login", "u1", CheckOptions::default())
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_monitor_mode_allows_and_records() {
        let (_, durable, engine) =
            engine_with(vec![config("signup", 2, LimitMode::Monitor)]).await;

        for _ in 0..4 {
            let decision = engine
                .check_limit("signup", "u1", CheckOptions::default())
                .await;
            assert!(decision.allowed, "monitor mode never denies");
        }

        let events = durable
            .list_events(&EventQuery {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.events.len(), 1, "one event at the crossing");
        assert_eq!(events.events[0].mode, LimitMode::Monitor);
        assert_eq!(events.events[0].blocked_until, None);
    }

    #[tokio::test]
    async fn test_unconfigured_module_allows() {
        let (_, _, engine) = engine_with(vec![]).await;
        let decision = engine
            .check_limit("never-configured", "u1", CheckOptions::default())
            .await;
        assert!(decision.allowed, "fallback config is inactive");
    }

    #[tokio::test]
    async fn test_oversized_key_fails_open() {
        let (_, _, engine) = engine_with(vec![config("api", 1, LimitMode::Enforce)]).await;
        let huge = "k".repeat(600);

        for _ in 0..3 {
            let decision = engine.check_limit("api", &huge, CheckOptions::default()).await;
            assert!(decision.allowed, "oversized keys never consume");
            assert_eq!(decision.remaining, 1);
        }
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (_, _, engine) = engine_with(vec![config("api", 5, LimitMode::Enforce)]).await;

        engine.check_limit("api", "u1", CheckOptions::default()).await;
        let peek = CheckOptions {
            increment: false,
            ..Default::default()
        };
        let a = engine.check_limit("api", "u1", peek.clone()).await;
        let b = engine.check_limit("api", "u1", peek).await;
        assert_eq!(a.remaining, 4);
        assert_eq!(b.remaining, 4);
    }

    #[tokio::test]
    async fn test_manual_block_denies_without_counting() {
        let (_, _, engine) = engine_with(vec![config("login", 5, LimitMode::Enforce)]).await;

        engine
            .create_block(ManualBlockParams {
                user_id: Some("baduser".to_string()),
                email: None,
                mail_domain: None,
                ip_address: None,
                cidr: None,
                asn: None,
                module: None,
                reason: Some("abuse".to_string()),
                blocked_by: "admin".to_string(),
                unblocked_at: None,
                overwrite: false,
            })
            .await
            .unwrap();

        let denied = engine
            .check_limit(
                "login",
                "baduser",
                CheckOptions {
                    user_id: Some("baduser".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(!denied.allowed);
        assert_eq!(denied.blocked_until_ms, None, "indefinite block");

        // The counter never saw the denied request.
        let ok = engine
            .check_limit("login", "otheruser", CheckOptions::default())
            .await;
        assert_eq!(ok.remaining, 4);
    }

    #[tokio::test]
    async fn test_manual_block_by_ip_matches_raw_ip() {
        let (_, _, engine) = engine_with(vec![config("login", 5, LimitMode::Enforce)]).await;

        engine
            .create_block(ManualBlockParams {
                user_id: None,
                email: None,
                mail_domain: None,
                ip_address: Some("203.0.113.9".to_string()),
                cidr: None,
                asn: None,
                module: Some("login".to_string()),
                reason: None,
                blocked_by: "admin".to_string(),
                unblocked_at: None,
                overwrite: false,
            })
            .await
            .unwrap();

        let denied = engine
            .check_limit(
                "login",
                "somekey",
                CheckOptions {
                    ip: Some("203.0.113.9".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(!denied.allowed);

        // Another module is unaffected by the module-scoped block.
        let ok = engine
            .check_limit(
                "api",
                "somekey",
                CheckOptions {
                    ip: Some("203.0.113.9".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(ok.allowed);
    }

    #[tokio::test]
    async fn test_reset_limits_restores_allowance() {
        let (_, _, engine) = engine_with(vec![config("login", 2, LimitMode::Enforce)]).await;

        for _ in 0..3 {
            engine.check_limit("login", "u1", CheckOptions::default()).await;
        }
        let denied = engine
            .check_limit("login", "u1", CheckOptions::default())
            .await;
        assert!(!denied.allowed);

        engine.reset_limits(Some("u1"), Some("login")).await.unwrap();

        let decision = engine
            .check_limit("login", "u1", CheckOptions::default())
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_module_scoped_reset_deactivates_blocks() {
        let (_, _, engine) = engine_with(vec![config("login", 5, LimitMode::Enforce)]).await;

        engine
            .create_block(ManualBlockParams {
                user_id: Some("baduser".to_string()),
                email: None,
                mail_domain: None,
                ip_address: None,
                cidr: None,
                asn: None,
                module: Some("login".to_string()),
                reason: None,
                blocked_by: "admin".to_string(),
                unblocked_at: None,
                overwrite: false,
            })
            .await
            .unwrap();

        let options = CheckOptions {
            user_id: Some("baduser".to_string()),
            ..Default::default()
        };
        let denied = engine.check_limit("login", "baduser", options.clone()).await;
        assert!(!denied.allowed);

        // No key given: the module scope alone covers the block.
        engine.reset_limits(None, Some("login")).await.unwrap();

        let decision = engine.check_limit("login", "baduser", options).await;
        assert!(decision.allowed);
        assert!(engine
            .list_blocks(&BlockFilter {
                active_only: true,
                ..Default::default()
            })
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_full_reset_deactivates_all_blocks() {
        let (_, _, engine) = engine_with(vec![config("login", 5, LimitMode::Enforce)]).await;

        engine
            .create_block(ManualBlockParams {
                user_id: Some("baduser".to_string()),
                email: None,
                mail_domain: None,
                ip_address: None,
                cidr: None,
                asn: None,
                module: None, // sentinel `all`
                reason: None,
                blocked_by: "admin".to_string(),
                unblocked_at: None,
                overwrite: false,
            })
            .await
            .unwrap();

        engine.reset_limits(None, None).await.unwrap();

        let decision = engine
            .check_limit(
                "login",
                "baduser",
                CheckOptions {
                    user_id: Some("baduser".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_manage_limits_dry_run_then_apply() {
        let (clock, durable, engine) =
            engine_with(vec![config("login", 1, LimitMode::Enforce)]).await;
        let now = clock.now_ms();

        // Rows the durable tier accumulated while serving as fallback.
        let seed = ConsumeRequest {
            key: "u1".to_string(),
            module: "login".to_string(),
            config: config("login", 1, LimitMode::Enforce),
            increment: true,
            now_ms: now,
        };
        durable.consume(&seed).await.unwrap();
        durable.consume(&seed).await.unwrap(); // crosses the limit, blocked
        durable
            .consume(&ConsumeRequest {
                key: "u2".to_string(),
                ..seed.clone()
            })
            .await
            .unwrap();

        let filter = StateFilter {
            blocked_only: true,
            ..Default::default()
        };
        let dry = engine
            .manage_limits(&filter, StateAction::Clear, true)
            .await
            .unwrap();
        assert_eq!(dry.matched.len(), 1);
        assert_eq!(dry.matched[0].key, "u1");
        assert_eq!(dry.affected, 0);

        // Dry run changed nothing.
        let still = engine
            .manage_limits(&filter, StateAction::Clear, true)
            .await
            .unwrap();
        assert_eq!(still.matched.len(), 1);

        let applied = engine
            .manage_limits(&filter, StateAction::Clear, false)
            .await
            .unwrap();
        assert_eq!(applied.affected, 1);

        // The block is gone, the count and the unblocked row remain.
        let none = engine
            .manage_limits(&filter, StateAction::Clear, true)
            .await
            .unwrap();
        assert!(none.matched.is_empty());
        let all = engine
            .list_states(&StateFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_warning_events_recorded_once() {
        let (_, durable, engine) = engine_with(vec![RateLimitConfig {
            warn_threshold: 2,
            ..config("api", 5, LimitMode::Enforce)
        }])
        .await;

        for _ in 0..5 {
            let decision = engine
                .check_limit("api", "u1", CheckOptions::default())
                .await;
            assert!(decision.allowed);
        }

        let warnings = durable
            .list_events(&EventQuery {
                event_type: Some(EventType::Warning),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(warnings.events.len(), 1, "edge-triggered, deduplicated");
        assert_eq!(warnings.events[0].count, 3);
    }

    #[tokio::test]
    async fn test_config_update_takes_effect() {
        let (_, _, engine) = engine_with(vec![]).await;

        engine
            .update_config(config("upload", 1, LimitMode::Enforce))
            .await
            .unwrap();

        let a = engine
            .check_limit("upload", "u1", CheckOptions::default())
            .await;
        assert!(a.allowed);
        let b = engine
            .check_limit("upload", "u1", CheckOptions::default())
            .await;
        assert!(!b.allowed);
    }

    #[tokio::test]
    async fn test_maintenance_pass_cleans_up() {
        let (clock, durable, engine) =
            engine_with(vec![config("login", 5, LimitMode::Enforce)]).await;
        let now = clock.now_ms();

        // A leftover durable row from a fallback period.
        durable
            .consume(&ConsumeRequest {
                key: "u1".to_string(),
                module: "login".to_string(),
                config: config("login", 5, LimitMode::Enforce),
                increment: true,
                now_ms: now,
            })
            .await
            .unwrap();

        clock.advance(10 * 60_000);
        engine.run_maintenance().await;

        let states = durable
            .find_states(&StateFilter::default(), clock.now_ms(), None)
            .await
            .unwrap();
        assert!(states.is_empty(), "expired window rows removed");
    }

    #[tokio::test]
    async fn test_pii_never_stored_raw() {
        let (_, durable, engine) = engine_with(vec![RateLimitConfig {
            store_email_in_events: true,
            store_ip_in_events: true,
            ..config("login", 1, LimitMode::Enforce)
        }])
        .await;

        let options = CheckOptions {
            email: Some("victim@example.com".to_string()),
            ip: Some("198.51.100.7".to_string()),
            ..Default::default()
        };
        engine.check_limit("login", "u1", options.clone()).await;
        engine.check_limit("login", "u1", options).await;

        let events = durable
            .list_events(&EventQuery {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!events.events.is_empty());
        for event in &events.events {
            assert!(event.email_hash.as_deref().unwrap().starts_with("v1:"));
            assert!(event.ip_hash.as_deref().unwrap().starts_with("v1:"));
            assert_ne!(event.email_masked.as_deref(), Some("victim@example.com"));
            assert_ne!(event.ip_masked.as_deref(), Some("198.51.100.7"));
        }
    }

    #[tokio::test]
    async fn test_health_and_shutdown() {
        let (_, _, engine) = engine_with(vec![]).await;

        let status = engine.health().await;
        assert!(status.primary_healthy);
        assert!(status.fallback_healthy);
        assert!(status.using_primary);

        engine.shutdown().await.unwrap();
    }
}
