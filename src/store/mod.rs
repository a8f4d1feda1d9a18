//! Storage backends for window counters.
//!
//! Both backends implement the same [`CounterStore`] contract: the
//! in-process [`MemoryStore`] (fast, disposable) and the SQLite-backed
//! [`DurableStore`] (transactional, owns the data). [`ResilientStore`]
//! composes the two behind the same trait with half-open circuit-breaker
//! failover.
//!
//! Counting uses fixed windows aligned to `window_ms` boundaries rather
//! than a sliding log: memory and storage stay bounded, at the cost of
//! permitting a burst across a window boundary. The window state machine
//! lives in [`consume_in_slot`] so both backends share one implementation
//! and differ only in how they load and persist the slot atomically.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::rules::{LimitMode, RateLimitConfig};

mod durable;
mod memory;
mod resilient;

pub use durable::{DurableStore, StateAction};
pub use memory::MemoryStore;
pub use resilient::{HealthStatus, ResilientStore};

/// Sentinel module name matching every module.
pub const ALL_MODULES: &str = "all";

/// Errors that can occur in storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database-level failure on the durable backend.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A backend call exceeded the per-operation timeout.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend is unavailable or refused the operation.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// One consume (or peek) against a window counter.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    /// Counter key (user id, IP, email, or any caller-chosen identity).
    pub key: String,
    /// Module the limit applies to.
    pub module: String,
    /// Resolved config for the module.
    pub config: RateLimitConfig,
    /// False performs a read-only peek that never mutates state.
    pub increment: bool,
    /// Caller-supplied current time in epoch milliseconds.
    pub now_ms: i64,
}

/// An edge-triggered warning that the key is approaching its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarningInfo {
    /// Requests remaining in the window after this consume.
    pub remaining: u32,
    /// The configured warn threshold that was crossed.
    pub threshold: u32,
}

/// Result of a consume against a window counter.
#[derive(Debug, Clone)]
pub struct ConsumeOutcome {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests remaining in the window, clamped to zero.
    pub remaining: u32,
    /// Count after this call.
    pub count: u32,
    /// When the current window ends.
    pub reset_at_ms: i64,
    /// Active block expiry, if any.
    pub blocked_until_ms: Option<i64>,
    /// True only on the call that crossed the limit; the engine records
    /// exactly one block event per crossing.
    pub block_triggered: bool,
    /// Edge-triggered warning, if this consume crossed the threshold.
    pub warning: Option<WarningInfo>,
}

/// A block flag held in a backend's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Expiry in epoch milliseconds; `None` means indefinite.
    pub until_ms: Option<i64>,
}

/// Atomic "consume one unit" contract satisfied by every backend.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Consume one unit (or peek) for a key+module pair.
    async fn consume(&self, req: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError>;

    /// Remove counter state matching the scope. `None` for both wipes
    /// everything. Returns the number of entries removed where known.
    async fn reset(&self, key: Option<&str>, module: Option<&str>) -> Result<u64, StoreError>;

    /// Record a block flag for a target value within a module
    /// (or the sentinel module `all`).
    async fn set_block(
        &self,
        target: &str,
        module: &str,
        blocked_until_ms: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Remove a block flag for a target value.
    async fn clear_block(&self, target: &str, module: &str) -> Result<(), StoreError>;

    /// Whether an unexpired block covers the target for the module
    /// (matching `module` or `all`).
    async fn is_blocked(
        &self,
        target: &str,
        module: &str,
        now_ms: i64,
    ) -> Result<Option<BlockEntry>, StoreError>;

    /// Whether the backend can currently serve calls.
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Release backend resources, draining in-flight work.
    async fn shutdown(&self) -> Result<(), StoreError>;
}

/// Window counter state for one key+module pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSlot {
    /// Requests counted in the current window.
    pub count: u32,
    /// Window start, aligned to a `window_ms` boundary.
    pub window_start: i64,
    /// Window end (`window_start + window_ms`).
    pub window_end: i64,
    /// Active block expiry, if any.
    pub blocked_until: Option<i64>,
}

/// Start of the fixed window containing `now_ms`.
pub fn aligned_window_start(now_ms: i64, window_ms: i64) -> i64 {
    let window_ms = window_ms.max(1);
    now_ms - now_ms.rem_euclid(window_ms)
}

/// The shared window state machine: advance/reset the window, honor and
/// extend blocks, count, and detect edge transitions.
///
/// Callers guarantee exclusive access to the slot for the duration of the
/// call (a dashmap entry lock in memory, a transaction in SQL).
pub(crate) fn consume_in_slot(slot: &mut WindowSlot, req: &ConsumeRequest) -> ConsumeOutcome {
    let cfg = &req.config;
    let now = req.now_ms;
    let window_ms = cfg.window_ms.max(1);

    // Fresh key or expired window: reset with a newly aligned window,
    // carrying a block forward only while it is still unexpired.
    if slot.window_end <= now {
        let start = aligned_window_start(now, window_ms);
        let carried = slot.blocked_until.filter(|&b| b > now);
        *slot = WindowSlot {
            count: 0,
            window_start: start,
            window_end: start + window_ms,
            blocked_until: carried,
        };
    }

    // Lazy expiry of a block that lapsed mid-window.
    if matches!(slot.blocked_until, Some(b) if b <= now) {
        slot.blocked_until = None;
    }

    // Currently blocked.
    if let Some(blocked_until) = slot.blocked_until {
        match cfg.mode {
            LimitMode::Enforce => {
                let mut until = blocked_until;
                if req.increment {
                    // Extension only, capped at now + block duration, so a
                    // retry storm cannot latch the block indefinitely nor
                    // ever shorten it.
                    let ceiling = now + cfg.block_duration_ms();
                    if ceiling > until {
                        until = ceiling;
                        slot.blocked_until = Some(until);
                    }
                }
                return ConsumeOutcome {
                    allowed: false,
                    remaining: 0,
                    count: slot.count,
                    reset_at_ms: slot.window_end,
                    blocked_until_ms: Some(until),
                    block_triggered: false,
                    warning: None,
                };
            }
            LimitMode::Monitor => {
                // Self-heal: an operator switching a module from enforce
                // to monitor clears the leftover block.
                slot.blocked_until = None;
            }
        }
    }

    let max = cfg.max_requests;
    let remaining_before = max.saturating_sub(slot.count);

    // Read-only peek: report state, preview a warning, mutate nothing.
    if !req.increment {
        let warning = if cfg.warnings_enabled() && remaining_before <= cfg.warn_threshold {
            Some(WarningInfo {
                remaining: remaining_before,
                threshold: cfg.warn_threshold,
            })
        } else {
            None
        };
        return ConsumeOutcome {
            allowed: cfg.mode == LimitMode::Monitor || remaining_before > 0,
            remaining: remaining_before,
            count: slot.count,
            reset_at_ms: slot.window_end,
            blocked_until_ms: None,
            block_triggered: false,
            warning,
        };
    }

    slot.count += 1;
    let new_count = slot.count;
    let remaining_after = max.saturating_sub(new_count);

    if new_count > max {
        // Only the call that crosses the limit reports the transition;
        // later over-limit calls re-block silently.
        let transition = new_count == max + 1;
        return match cfg.mode {
            LimitMode::Enforce => {
                let until = now + cfg.block_duration_ms();
                slot.blocked_until = Some(until);
                ConsumeOutcome {
                    allowed: false,
                    remaining: 0,
                    count: new_count,
                    reset_at_ms: slot.window_end,
                    blocked_until_ms: Some(until),
                    block_triggered: transition,
                    warning: None,
                }
            }
            LimitMode::Monitor => ConsumeOutcome {
                allowed: true,
                remaining: 0,
                count: new_count,
                reset_at_ms: slot.window_end,
                blocked_until_ms: None,
                block_triggered: transition,
                warning: transition.then_some(WarningInfo {
                    remaining: 0,
                    threshold: cfg.warn_threshold,
                }),
            },
        };
    }

    // Edge-triggered warning: remaining crossed from above the threshold
    // to at or below it on this consume.
    let warning = if cfg.warnings_enabled()
        && remaining_before > cfg.warn_threshold
        && remaining_after <= cfg.warn_threshold
    {
        Some(WarningInfo {
            remaining: remaining_after,
            threshold: cfg.warn_threshold,
        })
    } else {
        None
    };

    ConsumeOutcome {
        allowed: true,
        remaining: remaining_after,
        count: new_count,
        reset_at_ms: slot.window_end,
        blocked_until_ms: None,
        block_triggered: false,
        warning,
    }
}

/// Persisted window counter row for one key+module pair.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    /// Row id.
    pub id: String,
    /// Counter key.
    pub key: String,
    /// Module.
    pub module: String,
    /// Requests counted in the stored window.
    pub count: i64,
    /// Window start in epoch milliseconds.
    pub window_start: i64,
    /// Window end in epoch milliseconds.
    pub window_end: i64,
    /// Active block expiry, if any.
    pub blocked_until: Option<i64>,
    /// Last mutation time.
    pub updated_at: i64,
}

/// AND-combined filters over persisted counter state.
#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    /// Exact module match.
    pub module: Option<String>,
    /// Exact key match.
    pub key: Option<String>,
    /// Substring match on the key (user-id searches).
    pub user_id_contains: Option<String>,
    /// Exact key match against an IP address.
    pub ip_address: Option<String>,
    /// Exact key match against a lowercased email.
    pub email: Option<String>,
    /// Rows last updated more than this many milliseconds ago.
    pub older_than_ms: Option<i64>,
    /// Only rows whose window has already ended.
    pub expired_only: bool,
    /// Only rows with an unexpired block.
    pub blocked_only: bool,
    /// Minimum count (inclusive).
    pub min_count: Option<i64>,
    /// Maximum count (inclusive).
    pub max_count: Option<i64>,
}
