//! Durable counter backend on SQLite.
//!
//! Owns the authoritative tables: window counter states, user blocks,
//! append-only events, and per-module configs. A consume runs as a single
//! read-modify-write transaction so concurrent consumes for the same key
//! cannot lose updates. The fast store only ever caches what lives here.

use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use async_trait::async_trait;
use tracing::debug;

use super::{
    consume_in_slot, BlockEntry, ConsumeOutcome, ConsumeRequest, CounterStore, RateLimitState,
    StateFilter, StoreError, WindowSlot, ALL_MODULES,
};
use crate::blocks::{BlockFilter, BlockTargets, UserBlock};
use crate::events::{EventPage, EventQuery, EventType, RateLimitEvent};
use crate::rules::{LimitMode, RateLimitConfig};

/// Action applied by `manage_limits` to matching state rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    /// Zero the counter and clear any block.
    Reset,
    /// Clear only the block, keep the count.
    Clear,
    /// Delete the row entirely.
    Delete,
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS rate_limit_configs (
        module TEXT PRIMARY KEY,
        max_requests INTEGER NOT NULL,
        window_ms INTEGER NOT NULL,
        block_ms INTEGER,
        warn_threshold INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        mode TEXT NOT NULL DEFAULT 'enforce',
        store_email_in_events INTEGER NOT NULL DEFAULT 0,
        store_ip_in_events INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS rate_limit_states (
        id TEXT PRIMARY KEY,
        limit_key TEXT NOT NULL,
        module TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0,
        window_start INTEGER NOT NULL,
        window_end INTEGER NOT NULL,
        blocked_until INTEGER,
        updated_at INTEGER NOT NULL,
        UNIQUE(limit_key, module)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_blocks (
        id TEXT PRIMARY KEY,
        module TEXT NOT NULL DEFAULT 'all',
        user_id TEXT,
        email_hash TEXT,
        mail_domain TEXT,
        ip_hash TEXT,
        ip_prefix TEXT,
        cidr TEXT,
        asn INTEGER,
        reason TEXT,
        blocked_by TEXT NOT NULL,
        blocked_at INTEGER NOT NULL,
        unblocked_at INTEGER,
        is_active INTEGER NOT NULL DEFAULT 1
    )"#,
    r#"CREATE TABLE IF NOT EXISTS rate_limit_events (
        id TEXT PRIMARY KEY,
        module TEXT NOT NULL,
        limit_key TEXT NOT NULL,
        event_type TEXT NOT NULL,
        mode TEXT NOT NULL,
        user_id TEXT,
        email_hash TEXT,
        email_masked TEXT,
        ip_hash TEXT,
        ip_prefix TEXT,
        ip_masked TEXT,
        count INTEGER NOT NULL,
        max_requests INTEGER NOT NULL,
        window_start INTEGER NOT NULL,
        window_end INTEGER NOT NULL,
        blocked_until INTEGER,
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_states_module ON rate_limit_states(module)",
    "CREATE INDEX IF NOT EXISTS idx_blocks_active ON user_blocks(is_active, module)",
    "CREATE INDEX IF NOT EXISTS idx_events_module_time ON rate_limit_events(module, created_at)",
];

/// Transactional relational backend over SQLite.
pub struct DurableStore {
    pool: SqlitePool,
}

impl DurableStore {
    /// Connect to a SQLite database and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// An isolated in-memory database, mainly for tests.
    ///
    /// Uses a single connection: each in-memory SQLite connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // Reaping the only connection would drop the database.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Whether the events table carries the given optional column.
    ///
    /// Checked once at startup by the event recorder so writes can omit
    /// fields an older schema does not have.
    pub async fn event_table_has_column(&self, column: &str) -> Result<bool, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info('rate_limit_events') WHERE name = ?1")
                .bind(column)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    // --- configs -----------------------------------------------------------

    /// Load every stored module config.
    pub async fn load_configs(&self) -> Result<Vec<RateLimitConfig>, StoreError> {
        let rows = sqlx::query("SELECT module, max_requests, window_ms, block_ms, warn_threshold, is_active, mode, store_email_in_events, store_ip_in_events FROM rate_limit_configs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(config_from_row).collect())
    }

    /// Insert or replace a module config.
    pub async fn upsert_config(&self, config: &RateLimitConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO rate_limit_configs
               (module, max_requests, window_ms, block_ms, warn_threshold, is_active, mode, store_email_in_events, store_ip_in_events)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(module) DO UPDATE SET
                 max_requests = excluded.max_requests,
                 window_ms = excluded.window_ms,
                 block_ms = excluded.block_ms,
                 warn_threshold = excluded.warn_threshold,
                 is_active = excluded.is_active,
                 mode = excluded.mode,
                 store_email_in_events = excluded.store_email_in_events,
                 store_ip_in_events = excluded.store_ip_in_events"#,
        )
        .bind(&config.module)
        .bind(config.max_requests as i64)
        .bind(config.window_ms)
        .bind(config.block_ms)
        .bind(config.warn_threshold as i64)
        .bind(config.is_active)
        .bind(config.mode.as_str())
        .bind(config.store_email_in_events)
        .bind(config.store_ip_in_events)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- states ------------------------------------------------------------

    /// Find state rows matching the AND-combined filter.
    pub async fn find_states(
        &self,
        filter: &StateFilter,
        now_ms: i64,
        page: Option<(i64, i64)>,
    ) -> Result<Vec<RateLimitState>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, limit_key, module, count, window_start, window_end, blocked_until, updated_at FROM rate_limit_states WHERE 1=1",
        );
        push_state_filter(&mut qb, filter, now_ms);
        qb.push(" ORDER BY updated_at DESC");
        if let Some((limit, offset)) = page {
            qb.push(" LIMIT ").push_bind(limit);
            qb.push(" OFFSET ").push_bind(offset);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(state_from_row).collect())
    }

    /// Apply a maintenance action to the given state rows.
    pub async fn apply_state_action(
        &self,
        ids: &[String],
        action: StateAction,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut qb = match action {
            StateAction::Reset => {
                let mut qb = QueryBuilder::<Sqlite>::new(
                    "UPDATE rate_limit_states SET count = 0, blocked_until = NULL, updated_at = ",
                );
                qb.push_bind(now_ms);
                qb.push(" WHERE id IN (");
                qb
            }
            StateAction::Clear => {
                let mut qb = QueryBuilder::<Sqlite>::new(
                    "UPDATE rate_limit_states SET blocked_until = NULL, updated_at = ",
                );
                qb.push_bind(now_ms);
                qb.push(" WHERE id IN (");
                qb
            }
            StateAction::Delete => {
                QueryBuilder::<Sqlite>::new("DELETE FROM rate_limit_states WHERE id IN (")
            }
        };

        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        qb.push(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Fetch a single state row by id.
    pub async fn get_state(&self, id: &str) -> Result<Option<RateLimitState>, StoreError> {
        let row = sqlx::query("SELECT id, limit_key, module, count, window_start, window_end, blocked_until, updated_at FROM rate_limit_states WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(state_from_row))
    }

    /// Delete a single state row by id. Returns false when absent.
    pub async fn delete_state(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM rate_limit_states WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete state rows whose window ended before `now_ms`. Rows with an
    /// unexpired block are kept.
    pub async fn cleanup_expired_states(&self, now_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM rate_limit_states WHERE window_end <= ?1 AND (blocked_until IS NULL OR blocked_until <= ?1)",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- blocks ------------------------------------------------------------

    /// Insert a user block row.
    pub async fn insert_block(&self, block: &UserBlock) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO user_blocks
               (id, module, user_id, email_hash, mail_domain, ip_hash, ip_prefix, cidr, asn, reason, blocked_by, blocked_at, unblocked_at, is_active)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"#,
        )
        .bind(&block.id)
        .bind(&block.module)
        .bind(&block.user_id)
        .bind(&block.email_hash)
        .bind(&block.mail_domain)
        .bind(&block.ip_hash)
        .bind(&block.ip_prefix)
        .bind(&block.cidr)
        .bind(block.asn)
        .bind(&block.reason)
        .bind(&block.blocked_by)
        .bind(block.blocked_at)
        .bind(block.unblocked_at)
        .bind(block.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Find an active, unexpired block matching any of the given targets
    /// for the module (or the sentinel `all`).
    pub async fn find_active_block_matching(
        &self,
        targets: &BlockTargets,
        module: &str,
        now_ms: i64,
    ) -> Result<Option<UserBlock>, StoreError> {
        let clauses: Vec<(&str, &Option<String>)> = vec![
            ("user_id", &targets.user_id),
            ("email_hash", &targets.email_hash),
            ("mail_domain", &targets.mail_domain),
            ("ip_hash", &targets.ip_hash),
            ("ip_prefix", &targets.ip_prefix),
            ("cidr", &targets.cidr),
        ];
        if clauses.iter().all(|(_, v)| v.is_none()) {
            return Ok(None);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM user_blocks WHERE is_active = 1 AND (unblocked_at IS NULL OR unblocked_at > ",
        );
        qb.push_bind(now_ms);
        qb.push(") AND module IN (");
        qb.push_bind(module);
        qb.push(", ");
        qb.push_bind(ALL_MODULES);
        qb.push(") AND (0=1");
        for (column, value) in clauses {
            if let Some(value) = value {
                qb.push(format!(" OR {} = ", column));
                qb.push_bind(value);
            }
        }
        qb.push(") LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(block_from_row))
    }

    /// Fetch a block by id.
    pub async fn get_block(&self, id: &str) -> Result<Option<UserBlock>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_blocks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(block_from_row))
    }

    /// Deactivate a block by id, stamping `unblocked_at`.
    /// Returns false when the block does not exist or is already inactive.
    pub async fn deactivate_block(&self, id: &str, now_ms: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE user_blocks SET is_active = 0, unblocked_at = COALESCE(unblocked_at, ?2) WHERE id = ?1 AND is_active = 1",
        )
        .bind(id)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List blocks matching the filter.
    pub async fn list_blocks(
        &self,
        filter: &BlockFilter,
        now_ms: i64,
    ) -> Result<Vec<UserBlock>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM user_blocks WHERE 1=1");
        push_block_filter(&mut qb, filter, now_ms);
        qb.push(" ORDER BY blocked_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
            if let Some(offset) = filter.offset {
                qb.push(" OFFSET ").push_bind(offset);
            }
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(block_from_row).collect())
    }

    /// Deactivate every block matching the filter. Returns the count.
    pub async fn bulk_deactivate_blocks(
        &self,
        filter: &BlockFilter,
        now_ms: i64,
    ) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE user_blocks SET is_active = 0, unblocked_at = COALESCE(unblocked_at, ",
        );
        qb.push_bind(now_ms);
        qb.push(") WHERE is_active = 1");
        push_block_filter(&mut qb, filter, now_ms);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Mark blocks whose `unblocked_at` has passed as inactive.
    pub async fn cleanup_expired_blocks(&self, now_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE user_blocks SET is_active = 0 WHERE is_active = 1 AND unblocked_at IS NOT NULL AND unblocked_at <= ?1",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Every active, unexpired block. Used to rebuild the fast cache.
    pub async fn active_blocks(&self, now_ms: i64) -> Result<Vec<UserBlock>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM user_blocks WHERE is_active = 1 AND (unblocked_at IS NULL OR unblocked_at > ?1)",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(block_from_row).collect())
    }

    // --- events ------------------------------------------------------------

    /// Append an event. `include_ip_prefix` reflects the schema capability
    /// probed at startup.
    pub async fn insert_event(
        &self,
        event: &RateLimitEvent,
        include_ip_prefix: bool,
    ) -> Result<(), StoreError> {
        if include_ip_prefix {
            sqlx::query(
                r#"INSERT INTO rate_limit_events
                   (id, module, limit_key, event_type, mode, user_id, email_hash, email_masked, ip_hash, ip_prefix, ip_masked, count, max_requests, window_start, window_end, blocked_until, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"#,
            )
            .bind(&event.id)
            .bind(&event.module)
            .bind(&event.key)
            .bind(event.event_type.as_str())
            .bind(event.mode.as_str())
            .bind(&event.user_id)
            .bind(&event.email_hash)
            .bind(&event.email_masked)
            .bind(&event.ip_hash)
            .bind(&event.ip_prefix)
            .bind(&event.ip_masked)
            .bind(event.count)
            .bind(event.max_requests)
            .bind(event.window_start)
            .bind(event.window_end)
            .bind(event.blocked_until)
            .bind(event.created_at)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"INSERT INTO rate_limit_events
                   (id, module, limit_key, event_type, mode, user_id, email_hash, email_masked, ip_hash, ip_masked, count, max_requests, window_start, window_end, blocked_until, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
            )
            .bind(&event.id)
            .bind(&event.module)
            .bind(&event.key)
            .bind(event.event_type.as_str())
            .bind(event.mode.as_str())
            .bind(&event.user_id)
            .bind(&event.email_hash)
            .bind(&event.email_masked)
            .bind(&event.ip_hash)
            .bind(&event.ip_masked)
            .bind(event.count)
            .bind(event.max_requests)
            .bind(event.window_start)
            .bind(event.window_end)
            .bind(event.blocked_until)
            .bind(event.created_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// List events with cursor pagination, newest first.
    pub async fn list_events(&self, query: &EventQuery) -> Result<EventPage, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM rate_limit_events WHERE 1=1");
        if let Some(module) = &query.module {
            qb.push(" AND module = ").push_bind(module);
        }
        if let Some(event_type) = query.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(mode) = query.mode {
            qb.push(" AND mode = ").push_bind(mode.as_str());
        }
        if let Some(key) = &query.key {
            qb.push(" AND limit_key = ").push_bind(key);
        }
        if let Some(from) = query.from_ms {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = query.to_ms {
            qb.push(" AND created_at <= ").push_bind(to);
        }
        if let Some((created_at, id)) = query.cursor.as_deref().and_then(parse_cursor) {
            qb.push(" AND (created_at < ")
                .push_bind(created_at)
                .push(" OR (created_at = ")
                .push_bind(created_at)
                .push(" AND id < ")
                .push_bind(id)
                .push("))");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        qb.push_bind(query.limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let events: Vec<RateLimitEvent> = rows.iter().map(event_from_row).collect();
        let next_cursor = if events.len() as i64 == query.limit {
            events
                .last()
                .map(|e| format!("{}:{}", e.created_at, e.id))
        } else {
            None
        };
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

}

fn parse_cursor(cursor: &str) -> Option<(i64, String)> {
    let (created_at, id) = cursor.split_once(':')?;
    Some((created_at.parse().ok()?, id.to_string()))
}

fn push_state_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &StateFilter, now_ms: i64) {
    if let Some(module) = &filter.module {
        qb.push(" AND module = ").push_bind(module.clone());
    }
    if let Some(key) = &filter.key {
        qb.push(" AND limit_key = ").push_bind(key.clone());
    }
    if let Some(fragment) = &filter.user_id_contains {
        qb.push(" AND limit_key LIKE ")
            .push_bind(format!("%{}%", fragment));
    }
    if let Some(ip) = &filter.ip_address {
        qb.push(" AND limit_key = ").push_bind(ip.clone());
    }
    if let Some(email) = &filter.email {
        qb.push(" AND limit_key = ").push_bind(email.to_lowercase());
    }
    if let Some(age) = filter.older_than_ms {
        qb.push(" AND updated_at < ").push_bind(now_ms - age);
    }
    if filter.expired_only {
        qb.push(" AND window_end <= ").push_bind(now_ms);
    }
    if filter.blocked_only {
        qb.push(" AND blocked_until IS NOT NULL AND blocked_until > ")
            .push_bind(now_ms);
    }
    if let Some(min) = filter.min_count {
        qb.push(" AND count >= ").push_bind(min);
    }
    if let Some(max) = filter.max_count {
        qb.push(" AND count <= ").push_bind(max);
    }
}

fn push_block_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &BlockFilter, now_ms: i64) {
    if let Some(module) = &filter.module {
        qb.push(" AND module = ").push_bind(module.clone());
    }
    if filter.active_only {
        qb.push(" AND is_active = 1 AND (unblocked_at IS NULL OR unblocked_at > ")
            .push_bind(now_ms)
            .push(")");
    }
    if filter.expired_only {
        qb.push(" AND unblocked_at IS NOT NULL AND unblocked_at <= ")
            .push_bind(now_ms);
    }
    if let Some(blocked_by) = &filter.blocked_by {
        qb.push(" AND blocked_by = ").push_bind(blocked_by.clone());
    }
    if let Some(target) = &filter.target {
        qb.push(" AND (user_id = ")
            .push_bind(target.clone())
            .push(" OR email_hash = ")
            .push_bind(target.clone())
            .push(" OR mail_domain = ")
            .push_bind(target.clone())
            .push(" OR ip_hash = ")
            .push_bind(target.clone())
            .push(" OR ip_prefix = ")
            .push_bind(target.clone())
            .push(" OR cidr = ")
            .push_bind(target.clone())
            .push(")");
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND blocked_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND blocked_at <= ").push_bind(before);
    }
}

fn config_from_row(row: &SqliteRow) -> RateLimitConfig {
    RateLimitConfig {
        module: row.get("module"),
        max_requests: row.get::<i64, _>("max_requests") as u32,
        window_ms: row.get("window_ms"),
        block_ms: row.get("block_ms"),
        warn_threshold: row.get::<i64, _>("warn_threshold") as u32,
        is_active: row.get("is_active"),
        mode: LimitMode::from_str_or_default(row.get("mode")),
        store_email_in_events: row.get("store_email_in_events"),
        store_ip_in_events: row.get("store_ip_in_events"),
        is_fallback: false,
    }
}

fn state_from_row(row: &SqliteRow) -> RateLimitState {
    RateLimitState {
        id: row.get("id"),
        key: row.get("limit_key"),
        module: row.get("module"),
        count: row.get("count"),
        window_start: row.get("window_start"),
        window_end: row.get("window_end"),
        blocked_until: row.get("blocked_until"),
        updated_at: row.get("updated_at"),
    }
}

fn block_from_row(row: &SqliteRow) -> UserBlock {
    UserBlock {
        id: row.get("id"),
        module: row.get("module"),
        user_id: row.get("user_id"),
        email_hash: row.get("email_hash"),
        mail_domain: row.get("mail_domain"),
        ip_hash: row.get("ip_hash"),
        ip_prefix: row.get("ip_prefix"),
        cidr: row.get("cidr"),
        asn: row.get("asn"),
        reason: row.get("reason"),
        blocked_by: row.get("blocked_by"),
        blocked_at: row.get("blocked_at"),
        unblocked_at: row.get("unblocked_at"),
        is_active: row.get("is_active"),
    }
}

fn event_from_row(row: &SqliteRow) -> RateLimitEvent {
    RateLimitEvent {
        id: row.get("id"),
        module: row.get("module"),
        key: row.get("limit_key"),
        event_type: EventType::from_str_or_default(row.get("event_type")),
        mode: LimitMode::from_str_or_default(row.get("mode")),
        user_id: row.get("user_id"),
        email_hash: row.get("email_hash"),
        email_masked: row.get("email_masked"),
        ip_hash: row.get("ip_hash"),
        ip_prefix: row.get("ip_prefix"),
        ip_masked: row.get("ip_masked"),
        count: row.get("count"),
        max_requests: row.get("max_requests"),
        window_start: row.get("window_start"),
        window_end: row.get("window_end"),
        blocked_until: row.get("blocked_until"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl CounterStore for DurableStore {
    async fn consume(&self, req: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, count, window_start, window_end, blocked_until FROM rate_limit_states WHERE limit_key = ?1 AND module = ?2",
        )
        .bind(&req.key)
        .bind(&req.module)
        .fetch_optional(&mut *tx)
        .await?;

        let (id, mut slot) = match &row {
            Some(row) => (
                row.get::<String, _>("id"),
                WindowSlot {
                    count: row.get::<i64, _>("count") as u32,
                    window_start: row.get("window_start"),
                    window_end: row.get("window_end"),
                    blocked_until: row.get("blocked_until"),
                },
            ),
            None => (Uuid::new_v4().to_string(), WindowSlot::default()),
        };

        let before = slot.clone();
        let outcome = consume_in_slot(&mut slot, req);

        if slot != before {
            sqlx::query(
                r#"INSERT INTO rate_limit_states
                   (id, limit_key, module, count, window_start, window_end, blocked_until, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                   ON CONFLICT(limit_key, module) DO UPDATE SET
                     count = excluded.count,
                     window_start = excluded.window_start,
                     window_end = excluded.window_end,
                     blocked_until = excluded.blocked_until,
                     updated_at = excluded.updated_at"#,
            )
            .bind(&id)
            .bind(&req.key)
            .bind(&req.module)
            .bind(slot.count as i64)
            .bind(slot.window_start)
            .bind(slot.window_end)
            .bind(slot.blocked_until)
            .bind(req.now_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            key = %req.key,
            module = %req.module,
            count = outcome.count,
            allowed = outcome.allowed,
            "durable consume"
        );

        Ok(outcome)
    }

    async fn reset(&self, key: Option<&str>, module: Option<&str>) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM rate_limit_states WHERE 1=1");
        if let Some(key) = key {
            qb.push(" AND limit_key = ").push_bind(key.to_string());
        }
        if let Some(module) = module {
            qb.push(" AND module = ").push_bind(module.to_string());
        }
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn set_block(
        &self,
        target: &str,
        module: &str,
        blocked_until_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        // Counter-level block on the state row; user blocks proper are
        // rows in user_blocks, written by the block registry.
        let until = blocked_until_ms.unwrap_or(i64::MAX);
        sqlx::query(
            r#"INSERT INTO rate_limit_states
               (id, limit_key, module, count, window_start, window_end, blocked_until, updated_at)
               VALUES (?1, ?2, ?3, 0, 0, 0, ?4, ?5)
               ON CONFLICT(limit_key, module) DO UPDATE SET
                 blocked_until = excluded.blocked_until,
                 updated_at = excluded.updated_at"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(target)
        .bind(module)
        .bind(until)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_block(&self, target: &str, module: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE rate_limit_states SET blocked_until = NULL WHERE limit_key = ?1 AND module = ?2",
        )
        .bind(target)
        .bind(module)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_blocked(
        &self,
        target: &str,
        module: &str,
        now_ms: i64,
    ) -> Result<Option<BlockEntry>, StoreError> {
        // The durable side answers from the authoritative block table.
        let row = sqlx::query(
            r#"SELECT unblocked_at FROM user_blocks
               WHERE is_active = 1
                 AND (unblocked_at IS NULL OR unblocked_at > ?1)
                 AND module IN (?2, ?3)
                 AND (user_id = ?4 OR email_hash = ?4 OR mail_domain = ?4 OR ip_hash = ?4 OR ip_prefix = ?4 OR cidr = ?4)
               LIMIT 1"#,
        )
        .bind(now_ms)
        .bind(module)
        .bind(ALL_MODULES)
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| BlockEntry {
            until_ms: row.get("unblocked_at"),
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
