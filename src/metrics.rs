//! Observability signals.
//!
//! The engine does not own a metrics pipeline; it emits signals through
//! the [`MetricsSink`] trait and lets the host wire them into whatever
//! collector it runs. [`TracingMetrics`] logs every signal through
//! `tracing` and is the default; [`NoopMetrics`] discards everything.

use std::time::Duration;

use tracing::{debug, info};

/// Sink for the engine's observability signals.
pub trait MetricsSink: Send + Sync {
    /// A `check_limit` call completed with the given outcome.
    fn check_outcome(&self, module: &str, allowed: bool);

    /// A block was created (`block_type`: manual/automatic,
    /// `target_type`: user/ip/email/domain/cidr).
    fn block_created(&self, block_type: &str, target_type: &str);

    /// Which backend is currently serving traffic.
    fn backend_active(&self, primary: bool);

    /// Routing switched between primary and fallback.
    fn backend_switch(&self, to_primary: bool);

    /// A backend call failed.
    fn backend_failure(&self, backend: &str);

    /// How long traffic was served by the fallback before recovery.
    fn fallback_duration(&self, duration: Duration);

    /// Latency of a named engine operation.
    fn operation_latency(&self, operation: &str, elapsed: Duration);

    /// An event was recorded, or dropped by warning deduplication.
    fn event_recorded(&self, event_type: &str, deduplicated: bool);
}

/// Metrics sink that logs every signal through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn check_outcome(&self, module: &str, allowed: bool) {
        debug!(module = %module, allowed = allowed, "rate limit check");
    }

    fn block_created(&self, block_type: &str, target_type: &str) {
        info!(block_type = %block_type, target_type = %target_type, "block created");
    }

    fn backend_active(&self, primary: bool) {
        debug!(primary = primary, "backend active");
    }

    fn backend_switch(&self, to_primary: bool) {
        info!(to_primary = to_primary, "backend switch");
    }

    fn backend_failure(&self, backend: &str) {
        debug!(backend = %backend, "backend failure");
    }

    fn fallback_duration(&self, duration: Duration) {
        info!(duration_ms = duration.as_millis() as u64, "fallback period ended");
    }

    fn operation_latency(&self, operation: &str, elapsed: Duration) {
        debug!(operation = %operation, elapsed_us = elapsed.as_micros() as u64, "operation latency");
    }

    fn event_recorded(&self, event_type: &str, deduplicated: bool) {
        debug!(event_type = %event_type, deduplicated = deduplicated, "event recorded");
    }
}

/// Metrics sink that discards every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn check_outcome(&self, _module: &str, _allowed: bool) {}
    fn block_created(&self, _block_type: &str, _target_type: &str) {}
    fn backend_active(&self, _primary: bool) {}
    fn backend_switch(&self, _to_primary: bool) {}
    fn backend_failure(&self, _backend: &str) {}
    fn fallback_duration(&self, _duration: Duration) {}
    fn operation_latency(&self, _operation: &str, _elapsed: Duration) {}
    fn event_recorded(&self, _event_type: &str, _deduplicated: bool) {}
}
