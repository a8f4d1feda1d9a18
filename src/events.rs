//! Rate limit event recording.
//!
//! Events are the audit trail: one row per threshold warning or block,
//! carrying only derived identity artifacts (hashes, masks, prefixes),
//! never raw PII. Warnings are deduplicated per `module:key` within a
//! TTL window so a hot key does not flood the table; blocks are always
//! recorded.
//!
//! Event persistence is best-effort by design: a failed insert is logged
//! and swallowed so the admission decision is never delayed or changed
//! by the audit path.

use std::sync::Arc;
use std::time::Duration;

use mini_moka::sync::Cache;
use tracing::warn;
use uuid::Uuid;

use crate::identity::{ip_prefix, mask_email, mask_ip, IdentityHasher};
use crate::metrics::MetricsSink;
use crate::rules::LimitMode;
use crate::store::DurableStore;

/// What happened: the warn threshold was crossed, or a block began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Warning,
    Block,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Warning => "warning",
            EventType::Block => "block",
        }
    }

    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "block" => EventType::Block,
            _ => EventType::Warning,
        }
    }
}

/// A persisted rate limit event.
#[derive(Debug, Clone)]
pub struct RateLimitEvent {
    pub id: String,
    pub module: String,
    pub key: String,
    pub event_type: EventType,
    pub mode: LimitMode,
    pub user_id: Option<String>,
    pub email_hash: Option<String>,
    pub email_masked: Option<String>,
    pub ip_hash: Option<String>,
    pub ip_prefix: Option<String>,
    pub ip_masked: Option<String>,
    pub count: i64,
    pub max_requests: i64,
    pub window_start: i64,
    pub window_end: i64,
    pub blocked_until: Option<i64>,
    pub created_at: i64,
}

/// Filter and cursor for listing events, newest first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub module: Option<String>,
    pub event_type: Option<EventType>,
    pub mode: Option<LimitMode>,
    pub key: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    /// Opaque `created_at:id` cursor from a previous page.
    pub cursor: Option<String>,
    pub limit: i64,
}

/// One page of events plus the cursor for the next, if any.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<RateLimitEvent>,
    pub next_cursor: Option<String>,
}

/// Raw material for an event. Email and IP are held in memory only and
/// must already be gated by the module's storage flags.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub module: String,
    pub key: String,
    pub event_type: EventType,
    pub mode: LimitMode,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub ip: Option<String>,
    pub count: i64,
    pub max_requests: i64,
    pub window_start: i64,
    pub window_end: i64,
    pub blocked_until: Option<i64>,
}

/// Writes events to the durable store, deduplicating warnings.
pub struct EventRecorder {
    durable: Arc<DurableStore>,
    hasher: Arc<IdentityHasher>,
    metrics: Arc<dyn MetricsSink>,
    /// `module:key` -> caller timestamp of the last recorded warning.
    /// Expiry is judged against caller time so the dedup window follows
    /// the injected clock; the cache TTL only bounds memory.
    warning_seen: Cache<String, i64>,
    warning_dedup_ms: i64,
    /// Whether the events table has the `ip_prefix` column, probed once
    /// at startup.
    supports_ip_prefix: bool,
}

impl EventRecorder {
    pub async fn new(
        durable: Arc<DurableStore>,
        hasher: Arc<IdentityHasher>,
        metrics: Arc<dyn MetricsSink>,
        warning_dedup: Duration,
    ) -> Self {
        let supports_ip_prefix = match durable.event_table_has_column("ip_prefix").await {
            Ok(supported) => supported,
            Err(error) => {
                warn!(error = %error, "event schema probe failed, omitting ip_prefix");
                false
            }
        };

        Self {
            durable,
            hasher,
            metrics,
            warning_seen: Cache::builder()
                .time_to_live(warning_dedup.max(Duration::from_millis(1)))
                .build(),
            warning_dedup_ms: warning_dedup.as_millis() as i64,
            supports_ip_prefix,
        }
    }

    /// Record an event. Returns whether a row was written (warnings may
    /// be dropped by deduplication). Persistence failures are swallowed.
    pub async fn record(&self, input: EventInput, now_ms: i64) -> bool {
        if input.event_type == EventType::Warning {
            let dedup_key = format!("{}:{}", input.module, input.key);
            let within_window = self
                .warning_seen
                .get(&dedup_key)
                .is_some_and(|recorded_at| now_ms - recorded_at < self.warning_dedup_ms);
            if within_window {
                self.metrics.event_recorded(input.event_type.as_str(), true);
                return false;
            }
            self.warning_seen.insert(dedup_key, now_ms);
        }

        let event = self.derive(input, now_ms);
        self.metrics.event_recorded(event.event_type.as_str(), false);

        if let Err(error) = self
            .durable
            .insert_event(&event, self.supports_ip_prefix)
            .await
        {
            warn!(
                module = %event.module,
                event_type = %event.event_type.as_str(),
                error = %error,
                "failed to persist rate limit event"
            );
            return false;
        }
        true
    }

    fn derive(&self, input: EventInput, now_ms: i64) -> RateLimitEvent {
        let (email_hash, email_masked) = match input.email.as_deref() {
            Some(email) => (Some(self.hasher.email_hash(email)), mask_email(email)),
            None => (None, None),
        };
        let (ip_hash, prefix, ip_masked) = match input.ip.as_deref() {
            Some(ip) => (Some(self.hasher.ip_hash(ip)), ip_prefix(ip), mask_ip(ip)),
            None => (None, None, None),
        };

        RateLimitEvent {
            id: Uuid::new_v4().to_string(),
            module: input.module,
            key: input.key,
            event_type: input.event_type,
            mode: input.mode,
            user_id: input.user_id,
            email_hash,
            email_masked,
            ip_hash,
            ip_prefix: prefix,
            ip_masked,
            count: input.count,
            max_requests: input.max_requests,
            window_start: input.window_start,
            window_end: input.window_end,
            blocked_until: input.blocked_until,
            created_at: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    async fn recorder(dedup: Duration) -> (Arc<DurableStore>, EventRecorder) {
        let durable = Arc::new(DurableStore::in_memory().await.unwrap());
        let recorder = EventRecorder::new(
            durable.clone(),
            Arc::new(IdentityHasher::new(Some("test-secret".to_string()))),
            Arc::new(NoopMetrics),
            dedup,
        )
        .await;
        (durable, recorder)
    }

    fn input(key: &str, event_type: EventType) -> EventInput {
        EventInput {
            module: "login".to_string(),
            key: key.to_string(),
            event_type,
            mode: LimitMode::Enforce,
            user_id: Some(key.to_string()),
            email: Some("john@example.com".to_string()),
            ip: Some("192.168.10.44".to_string()),
            count: 5,
            max_requests: 5,
            window_start: 0,
            window_end: 60_000,
            blocked_until: None,
        }
    }

    #[tokio::test]
    async fn test_event_stores_derived_identity_only() {
        let (durable, recorder) = recorder(Duration::from_secs(60)).await;

        assert!(recorder.record(input("u1", EventType::Block), 1_000).await);

        let page = durable
            .list_events(&EventQuery {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        let event = &page.events[0];

        assert!(event.email_hash.as_deref().unwrap().starts_with("v1:"));
        assert_eq!(event.email_masked.as_deref(), Some("j**n@e*****e.com"));
        assert!(event.ip_hash.as_deref().unwrap().starts_with("v1:"));
        assert_eq!(event.ip_prefix.as_deref(), Some("192.168.0.0/16"));
        assert_eq!(event.ip_masked.as_deref(), Some("192.168.***.***"));
        // The raw values must not appear anywhere on the row.
        assert_ne!(event.email_hash.as_deref(), Some("john@example.com"));
        assert_ne!(event.ip_hash.as_deref(), Some("192.168.10.44"));
    }

    #[tokio::test]
    async fn test_warnings_deduplicate_blocks_do_not() {
        let (durable, recorder) = recorder(Duration::from_secs(60)).await;

        assert!(recorder.record(input("u1", EventType::Warning), 1_000).await);
        assert!(!recorder.record(input("u1", EventType::Warning), 2_000).await);
        // Different key is its own dedup slot.
        assert!(recorder.record(input("u2", EventType::Warning), 2_000).await);

        assert!(recorder.record(input("u1", EventType::Block), 3_000).await);
        assert!(recorder.record(input("u1", EventType::Block), 4_000).await);

        let page = durable
            .list_events(&EventQuery {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 4);
    }

    #[tokio::test]
    async fn test_warning_dedup_window_follows_caller_time() {
        let (durable, recorder) = recorder(Duration::from_secs(60)).await;

        assert!(recorder.record(input("u1", EventType::Warning), 1_000).await);
        // One millisecond inside the window: still deduplicated.
        assert!(!recorder.record(input("u1", EventType::Warning), 60_999).await);
        // Past the window by caller time, no real waiting involved.
        assert!(recorder.record(input("u1", EventType::Warning), 61_001).await);

        let page = durable
            .list_events(&EventQuery {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 2);
    }

    #[tokio::test]
    async fn test_event_pagination_cursor() {
        let (durable, recorder) = recorder(Duration::from_secs(60)).await;

        for i in 0..5 {
            let mut event = input(&format!("u{}", i), EventType::Block);
            event.email = None;
            event.ip = None;
            recorder.record(event, 1_000 + i).await;
        }

        let first = durable
            .list_events(&EventQuery {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.events[0].key, "u4");
        let cursor = first.next_cursor.clone().unwrap();

        let second = durable
            .list_events(&EventQuery {
                limit: 2,
                cursor: Some(cursor),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.events.len(), 2);
        assert_eq!(second.events[0].key, "u2");

        let third = durable
            .list_events(&EventQuery {
                limit: 2,
                cursor: second.next_cursor.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(third.events.len(), 1);
        assert_eq!(third.events[0].key, "u0");
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_event_type_filter() {
        let (durable, recorder) = recorder(Duration::from_millis(1)).await;

        recorder.record(input("u1", EventType::Warning), 1_000).await;
        recorder.record(input("u1", EventType::Block), 2_000).await;

        let blocks = durable
            .list_events(&EventQuery {
                event_type: Some(EventType::Block),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(blocks.events.len(), 1);
        assert_eq!(blocks.events[0].event_type, EventType::Block);
    }
}
