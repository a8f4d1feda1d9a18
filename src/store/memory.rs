//! In-process fast counter backend.
//!
//! Holds window slots and block flags in dashmaps. Per-key atomicity
//! comes from dashmap's entry locking: a consume holds the entry's shard
//! lock for the duration of the slot update, so concurrent consumes for
//! the same key never lose increments.
//!
//! Everything here is a disposable cache of facts the durable store
//! owns; it can be dropped and rebuilt from the database at any time.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{
    consume_in_slot, BlockEntry, ConsumeOutcome, ConsumeRequest, CounterStore, StoreError,
    WindowSlot, ALL_MODULES,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    key: String,
    module: String,
}

/// In-memory fast store for window counters and block flags.
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<SlotKey, WindowSlot>,
    /// (target, module) -> block expiry; `i64::MAX` encodes indefinite.
    blocks: DashMap<SlotKey, i64>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counter slots (for tests and introspection).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn lookup_block(&self, target: &str, module: &str, now_ms: i64) -> Option<BlockEntry> {
        let key = SlotKey {
            key: target.to_string(),
            module: module.to_string(),
        };
        match self.blocks.get(&key) {
            Some(entry) => {
                let until = *entry;
                drop(entry);
                if until <= now_ms {
                    // Lazy expiry.
                    self.blocks.remove(&key);
                    None
                } else if until == i64::MAX {
                    Some(BlockEntry { until_ms: None })
                } else {
                    Some(BlockEntry {
                        until_ms: Some(until),
                    })
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn consume(&self, req: &ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        let key = SlotKey {
            key: req.key.clone(),
            module: req.module.clone(),
        };

        let mut entry = self.slots.entry(key).or_default();
        let outcome = consume_in_slot(entry.value_mut(), req);

        trace!(
            key = %req.key,
            module = %req.module,
            count = outcome.count,
            allowed = outcome.allowed,
            "memory consume"
        );

        Ok(outcome)
    }

    async fn reset(&self, key: Option<&str>, module: Option<&str>) -> Result<u64, StoreError> {
        let before = self.slots.len();
        self.slots.retain(|slot_key, _| {
            let key_matches = key.map_or(true, |k| slot_key.key == k);
            let module_matches = module.map_or(true, |m| slot_key.module == m);
            !(key_matches && module_matches)
        });
        Ok((before - self.slots.len()) as u64)
    }

    async fn set_block(
        &self,
        target: &str,
        module: &str,
        blocked_until_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        let key = SlotKey {
            key: target.to_string(),
            module: module.to_string(),
        };
        self.blocks.insert(key, blocked_until_ms.unwrap_or(i64::MAX));
        Ok(())
    }

    async fn clear_block(&self, target: &str, module: &str) -> Result<(), StoreError> {
        let key = SlotKey {
            key: target.to_string(),
            module: module.to_string(),
        };
        self.blocks.remove(&key);
        Ok(())
    }

    async fn is_blocked(
        &self,
        target: &str,
        module: &str,
        now_ms: i64,
    ) -> Result<Option<BlockEntry>, StoreError> {
        if let Some(hit) = self.lookup_block(target, module, now_ms) {
            return Ok(Some(hit));
        }
        // A block against the sentinel module covers every module.
        if module != ALL_MODULES {
            if let Some(hit) = self.lookup_block(target, ALL_MODULES, now_ms) {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        self.slots.clear();
        self.blocks.clear();
        Ok(())
    }
}
