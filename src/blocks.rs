//! Manual and automatic user blocks.
//!
//! A block row names one or more targets: user id, email hash, mail
//! domain, IP hash, network prefix, or CIDR range. The registry owns the
//! durable rows and keeps the fast store's block flags in sync, so the
//! hot path answers block checks with exact-match lookups. CIDR ranges
//! cannot be exact-matched and are checked against an in-process cache
//! of active ranges instead.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FloodgateError, Result};
use crate::identity::{
    ip_prefix, is_valid_domain, is_valid_email, is_valid_ip, mail_domain, Cidr, IdentityHasher,
};
use crate::metrics::MetricsSink;
use crate::store::{CounterStore, DurableStore, ResilientStore, StoreError, ALL_MODULES};

/// A stored block row. Identity columns carry derived artifacts only.
#[derive(Debug, Clone)]
pub struct UserBlock {
    pub id: String,
    /// Module this block applies to; `all` covers every module.
    pub module: String,
    pub user_id: Option<String>,
    pub email_hash: Option<String>,
    pub mail_domain: Option<String>,
    pub ip_hash: Option<String>,
    pub ip_prefix: Option<String>,
    pub cidr: Option<String>,
    pub asn: Option<i64>,
    pub reason: Option<String>,
    /// Who created the block: an admin identifier, or `system`.
    pub blocked_by: String,
    pub blocked_at: i64,
    /// When the block expires; `None` is indefinite.
    pub unblocked_at: Option<i64>,
    pub is_active: bool,
}

impl UserBlock {
    /// Whether the block is in force at the given instant.
    pub fn is_blocking(&self, now_ms: i64) -> bool {
        self.is_active && self.unblocked_at.map_or(true, |at| at > now_ms)
    }

    /// The exact-match targets to mirror into the fast store's block
    /// flags. CIDR ranges are excluded; they need containment checks.
    pub fn cache_targets(&self) -> Vec<String> {
        [
            &self.user_id,
            &self.email_hash,
            &self.mail_domain,
            &self.ip_hash,
            &self.ip_prefix,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

/// Exact-match columns used when probing for an existing block.
#[derive(Debug, Clone, Default)]
pub struct BlockTargets {
    pub user_id: Option<String>,
    pub email_hash: Option<String>,
    pub mail_domain: Option<String>,
    pub ip_hash: Option<String>,
    pub ip_prefix: Option<String>,
    pub cidr: Option<String>,
}

/// Filter for listing or bulk-deactivating blocks.
#[derive(Debug, Clone, Default)]
pub struct BlockFilter {
    pub module: Option<String>,
    pub active_only: bool,
    pub expired_only: bool,
    pub blocked_by: Option<String>,
    /// Matches any identity column exactly.
    pub target: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Input for a manually created block. At least one target is required;
/// raw email and IP are hashed before anything is stored.
#[derive(Debug, Clone)]
pub struct ManualBlockParams {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub mail_domain: Option<String>,
    pub ip_address: Option<String>,
    pub cidr: Option<String>,
    pub asn: Option<i64>,
    /// Defaults to the sentinel `all` when empty.
    pub module: Option<String>,
    pub reason: Option<String>,
    pub blocked_by: String,
    /// Expiry; `None` blocks indefinitely.
    pub unblocked_at: Option<i64>,
    /// Replace an existing overlapping block instead of failing.
    pub overwrite: bool,
}

/// The block that denied a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBlock {
    /// Which derived target matched.
    pub target: String,
    pub blocked_until: Option<i64>,
}

type CidrEntry = (Cidr, String, Option<i64>);

/// Owns block rows and keeps the fast store's flags in step with them.
pub struct BlockRegistry {
    durable: Arc<DurableStore>,
    store: Arc<ResilientStore>,
    hasher: Arc<IdentityHasher>,
    metrics: Arc<dyn MetricsSink>,
    /// Active CIDR blocks: (range, module, expiry).
    cidr_blocks: RwLock<Vec<CidrEntry>>,
}

impl BlockRegistry {
    pub fn new(
        durable: Arc<DurableStore>,
        store: Arc<ResilientStore>,
        hasher: Arc<IdentityHasher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            durable,
            store,
            hasher,
            metrics,
            cidr_blocks: RwLock::new(Vec::new()),
        }
    }

    /// Create a manual block from validated admin input.
    pub async fn create_manual_block(
        &self,
        params: ManualBlockParams,
        now_ms: i64,
    ) -> Result<UserBlock> {
        let block = self.build_block(&params, now_ms)?;

        let targets = BlockTargets {
            user_id: block.user_id.clone(),
            email_hash: block.email_hash.clone(),
            mail_domain: block.mail_domain.clone(),
            ip_hash: block.ip_hash.clone(),
            ip_prefix: block.ip_prefix.clone(),
            cidr: block.cidr.clone(),
        };
        if let Some(existing) = self
            .durable
            .find_active_block_matching(&targets, &block.module, now_ms)
            .await
            .map_err(FloodgateError::from)?
        {
            if !params.overwrite {
                return Err(FloodgateError::BlockExists);
            }
            self.deactivate(&existing.id, now_ms).await?;
        }

        self.durable
            .insert_block(&block)
            .await
            .map_err(FloodgateError::from)?;

        self.push_cache_flags(&block).await;
        if let Some(cidr) = block.cidr.as_deref().and_then(Cidr::parse) {
            self.cidr_blocks
                .write()
                .push((cidr, block.module.clone(), block.unblocked_at));
        }

        self.metrics
            .block_created("manual", target_type(&params));
        info!(
            block_id = %block.id,
            module = %block.module,
            blocked_by = %block.blocked_by,
            "manual block created"
        );
        Ok(block)
    }

    fn build_block(&self, params: &ManualBlockParams, now_ms: i64) -> Result<UserBlock> {
        let has_target = params.user_id.is_some()
            || params.email.is_some()
            || params.mail_domain.is_some()
            || params.ip_address.is_some()
            || params.cidr.is_some()
            || params.asn.is_some();
        if !has_target {
            return Err(FloodgateError::Validation(
                "a block needs at least one target".to_string(),
            ));
        }

        let email_hash = match params.email.as_deref() {
            Some(email) if !is_valid_email(email) => {
                return Err(FloodgateError::Validation(format!(
                    "invalid email address: {}",
                    crate::identity::mask_email(email).unwrap_or_else(|| "<unparseable>".to_string())
                )));
            }
            Some(email) => Some(self.hasher.email_hash(email)),
            None => None,
        };

        let domain = match params.mail_domain.as_deref() {
            Some(domain) if !is_valid_domain(domain) => {
                return Err(FloodgateError::Validation(format!(
                    "invalid mail domain: {}",
                    domain
                )));
            }
            Some(domain) => Some(domain.trim().to_lowercase()),
            None => None,
        };

        let (ip_hash, prefix) = match params.ip_address.as_deref() {
            Some(ip) if !is_valid_ip(ip) => {
                return Err(FloodgateError::Validation("invalid IP address".to_string()));
            }
            Some(ip) => (Some(self.hasher.ip_hash(ip)), ip_prefix(ip)),
            None => (None, None),
        };

        let cidr = match params.cidr.as_deref() {
            Some(raw) => match Cidr::parse(raw) {
                Some(parsed) => Some(parsed.to_string()),
                None => {
                    return Err(FloodgateError::Validation(format!(
                        "invalid CIDR range: {}",
                        raw
                    )));
                }
            },
            None => None,
        };

        if let Some(until) = params.unblocked_at {
            if until <= now_ms {
                return Err(FloodgateError::Validation(
                    "block expiry must be in the future".to_string(),
                ));
            }
        }

        Ok(UserBlock {
            id: Uuid::new_v4().to_string(),
            module: params
                .module
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| ALL_MODULES.to_string()),
            user_id: params.user_id.clone(),
            email_hash,
            mail_domain: domain,
            ip_hash,
            ip_prefix: prefix,
            cidr,
            asn: params.asn,
            reason: params.reason.clone(),
            blocked_by: params.blocked_by.clone(),
            blocked_at: now_ms,
            unblocked_at: params.unblocked_at,
            is_active: true,
        })
    }

    async fn push_cache_flags(&self, block: &UserBlock) {
        for target in block.cache_targets() {
            if let Err(error) = self
                .store
                .set_block(&target, &block.module, block.unblocked_at)
                .await
            {
                // Durable row exists; the flag lands on the next sync.
                warn!(target = %target, error = %error, "failed to push block flag");
            }
        }
    }

    async fn clear_cache_flags(&self, block: &UserBlock) {
        for target in block.cache_targets() {
            if let Err(error) = self.store.clear_block(&target, &block.module).await {
                warn!(target = %target, error = %error, "failed to clear block flag");
            }
        }
    }

    /// Find the first active block covering the given identity, if any.
    ///
    /// Raw email and IP are hashed before lookup; nothing raw leaves the
    /// process.
    pub async fn check_active_blocks(
        &self,
        module: &str,
        key: &str,
        user_id: Option<&str>,
        email: Option<&str>,
        ip: Option<&str>,
        now_ms: i64,
    ) -> std::result::Result<Option<ActiveBlock>, StoreError> {
        let mut candidates: Vec<String> = vec![key.to_string()];
        if let Some(user_id) = user_id {
            if user_id != key {
                candidates.push(user_id.to_string());
            }
        }
        if let Some(email) = email {
            candidates.push(self.hasher.email_hash(email));
            if let Some(domain) = mail_domain(email) {
                candidates.push(domain);
            }
        }
        if let Some(ip) = ip {
            candidates.push(self.hasher.ip_hash(ip));
            if let Some(prefix) = ip_prefix(ip) {
                candidates.push(prefix);
            }
        }

        for candidate in &candidates {
            if let Some(entry) = self.store.is_blocked(candidate, module, now_ms).await? {
                return Ok(Some(ActiveBlock {
                    target: candidate.clone(),
                    blocked_until: entry.until_ms,
                }));
            }
        }

        if let Some(addr) = ip.and_then(|ip| ip.trim().parse::<IpAddr>().ok()) {
            let hit = self.cidr_blocks.read().iter().find_map(|(cidr, m, until)| {
                let module_matches = m == module || m == ALL_MODULES;
                let live = until.map_or(true, |at| at > now_ms);
                if module_matches && live && cidr.contains(addr) {
                    Some(ActiveBlock {
                        target: cidr.to_string(),
                        blocked_until: *until,
                    })
                } else {
                    None
                }
            });
            if hit.is_some() {
                return Ok(hit);
            }
        }

        Ok(None)
    }

    /// Deactivate a block by id and drop its cache flags.
    /// Returns false when no active block had that id.
    pub async fn deactivate(&self, id: &str, now_ms: i64) -> Result<bool> {
        let Some(block) = self.durable.get_block(id).await.map_err(FloodgateError::from)? else {
            return Ok(false);
        };

        let deactivated = self
            .durable
            .deactivate_block(id, now_ms)
            .await
            .map_err(FloodgateError::from)?;
        if !deactivated {
            return Ok(false);
        }

        self.clear_cache_flags(&block).await;
        if block.cidr.is_some() {
            self.reload_cidr_cache(now_ms).await?;
        }
        info!(block_id = %id, "block deactivated");
        Ok(true)
    }

    /// Deactivate every block matching the filter. Returns the count.
    pub async fn bulk_deactivate(&self, filter: &BlockFilter, now_ms: i64) -> Result<u64> {
        // Fetch first so the cache flags of each victim can be dropped.
        let mut active_filter = filter.clone();
        active_filter.active_only = true;
        active_filter.limit = None;
        active_filter.offset = None;
        let victims = self
            .durable
            .list_blocks(&active_filter, now_ms)
            .await
            .map_err(FloodgateError::from)?;

        let count = self
            .durable
            .bulk_deactivate_blocks(filter, now_ms)
            .await
            .map_err(FloodgateError::from)?;

        for block in &victims {
            self.clear_cache_flags(block).await;
        }
        if victims.iter().any(|b| b.cidr.is_some()) {
            self.reload_cidr_cache(now_ms).await?;
        }
        info!(count = count, "bulk block deactivation");
        Ok(count)
    }

    /// Mark blocks whose expiry has passed as inactive. The fast store
    /// expires its flags lazily on its own.
    pub async fn cleanup(&self, now_ms: i64) -> Result<u64> {
        let expired = self
            .durable
            .cleanup_expired_blocks(now_ms)
            .await
            .map_err(FloodgateError::from)?;
        if expired > 0 {
            debug!(count = expired, "expired blocks deactivated");
            self.reload_cidr_cache(now_ms).await?;
        }
        Ok(expired)
    }

    /// List blocks matching the filter.
    pub async fn list(&self, filter: &BlockFilter, now_ms: i64) -> Result<Vec<UserBlock>> {
        self.durable
            .list_blocks(filter, now_ms)
            .await
            .map_err(FloodgateError::from)
    }

    /// Fetch a block by id.
    pub async fn get(&self, id: &str) -> Result<Option<UserBlock>> {
        self.durable.get_block(id).await.map_err(FloodgateError::from)
    }

    /// Rebuild the fast store's flags and the CIDR cache from the
    /// database. Called at startup and by periodic maintenance.
    pub async fn sync(&self, now_ms: i64) -> Result<()> {
        self.store
            .sync_blocks_from_database(now_ms)
            .await
            .map_err(FloodgateError::from)?;
        self.reload_cidr_cache(now_ms).await
    }

    async fn reload_cidr_cache(&self, now_ms: i64) -> Result<()> {
        let blocks = self
            .durable
            .active_blocks(now_ms)
            .await
            .map_err(FloodgateError::from)?;
        let entries: Vec<CidrEntry> = blocks
            .iter()
            .filter_map(|block| {
                let cidr = Cidr::parse(block.cidr.as_deref()?)?;
                Some((cidr, block.module.clone(), block.unblocked_at))
            })
            .collect();
        *self.cidr_blocks.write() = entries;
        Ok(())
    }
}

fn target_type(params: &ManualBlockParams) -> &'static str {
    if params.user_id.is_some() {
        "user"
    } else if params.email.is_some() {
        "email"
    } else if params.mail_domain.is_some() {
        "domain"
    } else if params.cidr.is_some() {
        "cidr"
    } else if params.ip_address.is_some() {
        "ip"
    } else {
        "asn"
    }
}
