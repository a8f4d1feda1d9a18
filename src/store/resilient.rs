//! Failover decorator over the fast and durable backends.
//!
//! Hot-path reads (`consume`, `is_blocked`) prefer the fast primary and
//! fall back to the durable store when the primary fails or times out.
//! A half-open breaker gates recovery: after a failure the primary is
//! skipped until `retry_interval` has passed, then the next call probes
//! it directly and a success switches traffic back.
//!
//! Administrative writes (`reset`, `set_block`, `clear_block`) go to the
//! durable store first and are mirrored to the primary best-effort, so a
//! primary wipe never loses a block or a reset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::durable::DurableStore;
use super::{BlockEntry, ConsumeOutcome, ConsumeRequest, CounterStore, StoreError};
use crate::metrics::MetricsSink;

/// Backend health as seen by [`ResilientStore::health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    pub primary_healthy: bool,
    pub fallback_healthy: bool,
    /// Whether the hot path is currently routed to the primary.
    pub using_primary: bool,
}

/// Two-tier counter store with automatic failover and recovery.
pub struct ResilientStore {
    primary: Arc<dyn CounterStore>,
    durable: Arc<DurableStore>,
    using_primary: AtomicBool,
    last_failure: Mutex<Option<Instant>>,
    fallback_since: Mutex<Option<Instant>>,
    retry_interval: Duration,
    op_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl ResilientStore {
    pub fn new(
        primary: Arc<dyn CounterStore>,
        durable: Arc<DurableStore>,
        retry_interval: Duration,
        op_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            primary,
            durable,
            using_primary: AtomicBool::new(true),
            last_failure: Mutex::new(None),
            fallback_since: Mutex::new(None),
            retry_interval,
            op_timeout,
            metrics,
        }
    }

    /// The durable backend, for callers that need its owned tables.
    pub fn durable(&self) -> &Arc<DurableStore> {
        &self.durable
    }

    /// Whether the hot path is currently routed to the primary.
    pub fn is_using_primary(&self) -> bool {
        self.using_primary.load(Ordering::Relaxed)
    }

    fn primary_eligible(&self) -> bool {
        if self.using_primary.load(Ordering::Relaxed) {
            return true;
        }
        // Half-open: allow one probe per retry interval.
        match *self.last_failure.lock() {
            Some(at) => at.elapsed() >= self.retry_interval,
            None => true,
        }
    }

    fn note_primary_success(&self) {
        *self.last_failure.lock() = None;
        if !self.using_primary.swap(true, Ordering::Relaxed) {
            let since = self.fallback_since.lock().take();
            if let Some(since) = since {
                self.metrics.fallback_duration(since.elapsed());
            }
            self.metrics.backend_switch(true);
            info!("primary store recovered, traffic switched back");
        }
        self.metrics.backend_active(true);
    }

    fn note_primary_failure(&self, operation: &str, error: &StoreError) {
        self.metrics.backend_failure("primary");
        *self.last_failure.lock() = Some(Instant::now());
        if self.using_primary.swap(false, Ordering::Relaxed) {
            *self.fallback_since.lock() = Some(Instant::now());
            self.metrics.backend_switch(false);
            warn!(operation = %operation, error = %error, "primary store failed, falling back to durable");
        } else {
            debug!(operation = %operation, error = %error, "primary store still failing");
        }
        self.metrics.backend_active(false);
    }

    async fn mirror_to_primary<F>(&self, operation: &str, result: Result<F, StoreError>)
    where
        F: Sized,
    {
        if let Err(error) = result {
            // The durable write already succeeded; a stale primary entry
            // is corrected by the next sync.
            warn!(operation = %operation, error = %error, "primary mirror write failed");
        }
    }

    /// Wipe counter state in both tiers. Both resets are attempted even
    /// when one fails; the first failure is reported after both settle.
    pub async fn clear_cache_completely(&self) -> Result<(), StoreError> {
        let (primary, durable) = futures::join!(
            self.primary.reset(None, None),
            self.durable.reset(None, None)
        );
        primary?;
        durable?;
        Ok(())
    }

    /// Drop the primary's cached slot for a key+module pair after an
    /// administrative edit of the durable row. Best effort.
    pub async fn invalidate_primary(&self, key: Option<&str>, module: Option<&str>) {
        if let Err(error) = self.primary.reset(key, module).await {
            warn!(error = %error, "primary cache invalidation failed");
        }
    }

    /// Replay every active block from the database into the primary's
    /// block flags. Called at startup and by periodic maintenance.
    pub async fn sync_blocks_from_database(&self, now_ms: i64) -> Result<u64, StoreError> {
        let blocks = self.durable.active_blocks(now_ms).await?;
        let mut synced = 0u64;
        for block in &blocks {
            for target in block.cache_targets() {
                match self
                    .primary
                    .set_block(&target, &block.module, block.unblocked_at)
                    .await
                {
                    Ok(()) => synced += 1,
                    Err(error) => {
                        warn!(target = %target, error = %error, "failed to sync block to primary");
                    }
                }
            }
        }
        debug!(blocks = blocks.len(), flags = synced, "block sync complete");
        Ok(synced)
    }

    /// Probe both backends.
    pub async fn health(&self) -> HealthStatus {
        let primary_healthy = self.primary.health_check().await.is_ok();
        let fallback_healthy = self.durable.health_check().await.is_ok();
        HealthStatus {
            primary_healthy,
            fallback_healthy,
            using_primary: self.is_using_primary(),
        }
    }
}

#[async_trait]
impl CounterStore for ResilientStore {
    async fn consume(&self, req: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        if self.primary_eligible() {
            match tokio::time::timeout(self.op_timeout, self.primary.consume(req)).await {
                Ok(Ok(outcome)) => {
                    self.note_primary_success();
                    return Ok(outcome);
                }
                Ok(Err(error)) => self.note_primary_failure("consume", &error),
                Err(_) => {
                    self.note_primary_failure("consume", &StoreError::Timeout(self.op_timeout))
                }
            }
        }
        self.durable.consume(req).await
    }

    async fn reset(&self, key: Option<&str>, module: Option<&str>) -> Result<u64, StoreError> {
        let removed = self.durable.reset(key, module).await?;
        let mirrored = self.primary.reset(key, module).await;
        self.mirror_to_primary("reset", mirrored).await;
        Ok(removed)
    }

    async fn set_block(
        &self,
        target: &str,
        module: &str,
        blocked_until_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        // Cache push only: the durable block row is written by the block
        // registry, and blindly mirroring into states would shadow it.
        self.primary.set_block(target, module, blocked_until_ms).await
    }

    async fn clear_block(&self, target: &str, module: &str) -> Result<(), StoreError> {
        self.primary.clear_block(target, module).await
    }

    async fn is_blocked(
        &self,
        target: &str,
        module: &str,
        now_ms: i64,
    ) -> Result<Option<BlockEntry>, StoreError> {
        if self.primary_eligible() {
            match tokio::time::timeout(self.op_timeout, self.primary.is_blocked(target, module, now_ms))
                .await
            {
                Ok(Ok(entry)) => {
                    self.note_primary_success();
                    return Ok(entry);
                }
                Ok(Err(error)) => self.note_primary_failure("is_blocked", &error),
                Err(_) => {
                    self.note_primary_failure("is_blocked", &StoreError::Timeout(self.op_timeout))
                }
            }
        }
        self.durable.is_blocked(target, module, now_ms).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        // Healthy as long as either backend can serve.
        let status = self.health().await;
        if status.primary_healthy || status.fallback_healthy {
            Ok(())
        } else {
            Err(StoreError::Unavailable("both backends down".to_string()))
        }
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        // Settle both before reporting; a failed primary shutdown must
        // not skip closing the database pool.
        let (primary, durable) = futures::join!(self.primary.shutdown(), self.durable.shutdown());
        if let Err(error) = primary {
            warn!(error = %error, "primary shutdown failed");
        }
        durable?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::rules::{LimitMode, RateLimitConfig};
    use crate::store::MemoryStore;

    /// Primary test double that fails on demand.
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::Relaxed);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::Relaxed) {
                Err(StoreError::Unavailable("flaky".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn consume(&self, req: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
            self.check()?;
            self.inner.consume(req).await
        }

        async fn reset(&self, key: Option<&str>, module: Option<&str>) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.reset(key, module).await
        }

        async fn set_block(
            &self,
            target: &str,
            module: &str,
            blocked_until_ms: Option<i64>,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.inner.set_block(target, module, blocked_until_ms).await
        }

        async fn clear_block(&self, target: &str, module: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.clear_block(target, module).await
        }

        async fn is_blocked(
            &self,
            target: &str,
            module: &str,
            now_ms: i64,
        ) -> Result<Option<BlockEntry>, StoreError> {
            self.check()?;
            self.inner.is_blocked(target, module, now_ms).await
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            self.check()
        }

        async fn shutdown(&self) -> Result<(), StoreError> {
            self.inner.shutdown().await
        }
    }

    fn request(key: &str, now: i64) -> ConsumeRequest {
        ConsumeRequest {
            key: key.to_string(),
            module: "test".to_string(),
            config: RateLimitConfig {
                module: "test".to_string(),
                max_requests: 100,
                window_ms: 60_000,
                block_ms: None,
                warn_threshold: 0,
                is_active: true,
                mode: LimitMode::Enforce,
                store_email_in_events: false,
                store_ip_in_events: false,
                is_fallback: false,
            },
            increment: true,
            now_ms: now,
        }
    }

    async fn build(
        retry_interval: Duration,
    ) -> (Arc<FlakyStore>, Arc<DurableStore>, ResilientStore) {
        let flaky = Arc::new(FlakyStore::new());
        let durable = Arc::new(DurableStore::in_memory().await.unwrap());
        let store = ResilientStore::new(
            flaky.clone(),
            durable.clone(),
            retry_interval,
            Duration::from_millis(500),
            Arc::new(NoopMetrics),
        );
        (flaky, durable, store)
    }

    #[tokio::test]
    async fn test_failover_and_recovery() {
        let (flaky, _durable, store) = build(Duration::ZERO).await;
        let now = 1_000_000;

        // Healthy: served by primary.
        let out = store.consume(&request("u1", now)).await.unwrap();
        assert_eq!(out.count, 1);
        assert!(store.is_using_primary());

        // Primary dies: calls fall through to durable.
        flaky.set_failing(true);
        let out = store.consume(&request("u1", now)).await.unwrap();
        assert!(!store.is_using_primary());
        // Durable never saw the first increment; it starts its own count.
        assert_eq!(out.count, 1);
        let out = store.consume(&request("u1", now)).await.unwrap();
        assert_eq!(out.count, 2);

        // Recovery: with a zero retry interval the next call probes the
        // primary and switches back.
        flaky.set_failing(false);
        let out = store.consume(&request("u1", now)).await.unwrap();
        assert!(store.is_using_primary());
        assert_eq!(out.count, 2, "primary kept its pre-failure count");
    }

    #[tokio::test]
    async fn test_retry_interval_gates_probes() {
        let (flaky, _durable, store) = build(Duration::from_secs(60)).await;
        let now = 1_000_000;

        flaky.set_failing(true);
        store.consume(&request("u1", now)).await.unwrap();
        assert!(!store.is_using_primary());

        // Primary heals, but the breaker holds for the retry interval.
        flaky.set_failing(false);
        store.consume(&request("u1", now)).await.unwrap();
        assert!(
            !store.is_using_primary(),
            "probe must wait out the retry interval"
        );
    }

    #[tokio::test]
    async fn test_slow_primary_times_out_to_fallback() {
        struct HangingStore;

        #[async_trait]
        impl CounterStore for HangingStore {
            async fn consume(&self, _req: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
                // Far longer than the configured op timeout.
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(StoreError::Unavailable("unreachable".to_string()))
            }
            async fn reset(&self, _: Option<&str>, _: Option<&str>) -> Result<u64, StoreError> {
                Ok(0)
            }
            async fn set_block(&self, _: &str, _: &str, _: Option<i64>) -> Result<(), StoreError> {
                Ok(())
            }
            async fn clear_block(&self, _: &str, _: &str) -> Result<(), StoreError> {
                Ok(())
            }
            async fn is_blocked(
                &self,
                _: &str,
                _: &str,
                _: i64,
            ) -> Result<Option<BlockEntry>, StoreError> {
                Ok(None)
            }
            async fn health_check(&self) -> Result<(), StoreError> {
                Ok(())
            }
            async fn shutdown(&self) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let durable = Arc::new(DurableStore::in_memory().await.unwrap());
        let store = ResilientStore::new(
            Arc::new(HangingStore),
            durable,
            Duration::from_secs(60),
            Duration::from_millis(100),
            Arc::new(NoopMetrics),
        );

        let out = store.consume(&request("u1", 1_000_000)).await.unwrap();
        assert_eq!(out.count, 1, "fallback served the call");
        assert!(!store.is_using_primary());
    }

    #[tokio::test]
    async fn test_admin_writes_reach_durable_even_when_primary_down() {
        let (flaky, durable, store) = build(Duration::from_secs(60)).await;
        let now = 1_000_000;

        store.consume(&request("u1", now)).await.unwrap();
        flaky.set_failing(true);
        store.consume(&request("u1", now)).await.unwrap();

        // Reset clears the durable row even while the primary is down.
        let removed = store.reset(Some("u1"), Some("test")).await.unwrap();
        assert_eq!(removed, 1);
        let states = durable
            .find_states(&Default::default(), now, None)
            .await
            .unwrap();
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_clear_cache_completely_settles_both() {
        let (flaky, durable, store) = build(Duration::from_secs(60)).await;
        let now = 1_000_000;

        store.consume(&request("u1", now)).await.unwrap();
        durable.consume(&request("u2", now)).await.unwrap();

        store.clear_cache_completely().await.unwrap();
        let states = durable
            .find_states(&Default::default(), now, None)
            .await
            .unwrap();
        assert!(states.is_empty());
        // The primary slot is gone too: the key counts fresh.
        let out = store.consume(&request("u1", now)).await.unwrap();
        assert_eq!(out.count, 1);

        // A primary failure is reported, but the durable wipe still runs.
        durable.consume(&request("u3", now)).await.unwrap();
        flaky.set_failing(true);
        assert!(store.clear_cache_completely().await.is_err());
        let states = durable
            .find_states(&Default::default(), now, None)
            .await
            .unwrap();
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_health_reports_both_backends() {
        let (flaky, _durable, store) = build(Duration::ZERO).await;

        let status = store.health().await;
        assert!(status.primary_healthy);
        assert!(status.fallback_healthy);

        flaky.set_failing(true);
        let status = store.health().await;
        assert!(!status.primary_healthy);
        assert!(status.fallback_healthy);
        assert!(store.health_check().await.is_ok());
    }
}
