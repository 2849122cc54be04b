//! Time-bounded block list keyed by client identifier
//!
//! An identifier is rejected until its expiry passes. Expired entries are
//! evicted on the lookup that finds them and by the periodic sweep, so an
//! entry is never reported blocked after expiry nor allowed before it.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Millis;
use crate::models::SecurityEventType;

/// Number of shards for DashMap (power of 2 for efficient hashing)
const NUM_SHARDS: usize = 32;

/// Why an identifier was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "event")]
pub enum BlockReason {
    Detection(SecurityEventType),
    Manual,
}

impl BlockReason {
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::Detection(event_type) => event_type.as_str(),
            BlockReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub blocked_at_ms: Millis,
    pub expires_at_ms: Millis,
    pub reason: BlockReason,
}

impl BlockEntry {
    #[inline]
    pub fn is_active(&self, now: Millis) -> bool {
        now < self.expires_at_ms
    }
}

#[derive(Debug)]
pub struct BlockRegistry {
    entries: DashMap<String, BlockEntry>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_capacity_and_shard_amount(256, NUM_SHARDS),
        }
    }

    /// Insert or overwrite a block expiring at `now + duration_ms`
    pub fn block(&self, id: &str, duration_ms: Millis, reason: BlockReason, now: Millis) -> BlockEntry {
        let entry = BlockEntry {
            blocked_at_ms: now,
            expires_at_ms: now.saturating_add(duration_ms),
            reason,
        };
        self.entries.insert(id.to_string(), entry.clone());

        info!(
            client = %id,
            reason = %reason,
            duration_secs = duration_ms / 1000,
            "Client blocked"
        );
        entry
    }

    /// True iff an unexpired entry exists. Evicts the entry if expired.
    pub fn is_blocked(&self, id: &str, now: Millis) -> bool {
        self.get(id, now).is_some()
    }

    /// Active entry for `id`, evicting it if expired
    pub fn get(&self, id: &str, now: Millis) -> Option<BlockEntry> {
        let entry = self.entries.get(id).map(|e| e.clone())?;
        if entry.is_active(now) {
            return Some(entry);
        }

        // Another writer may have re-blocked in between; only drop the stale one
        if self
            .entries
            .remove_if(id, |_, e| !e.is_active(now))
            .is_some()
        {
            debug!(client = %id, "Block expired, evicted");
        }
        None
    }

    /// Milliseconds until the block lifts
    pub fn remaining_ms(&self, id: &str, now: Millis) -> Option<Millis> {
        self.get(id, now).map(|e| e.expires_at_ms - now)
    }

    /// Lift a block early
    pub fn unblock(&self, id: &str) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            info!(client = %id, "Client unblocked");
        }
        removed
    }

    /// Currently blocked identifiers
    pub fn blocked_ids(&self, now: Millis) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_active(now))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self, now: Millis) -> usize {
        self.entries.iter().filter(|e| e.value().is_active(now)).count()
    }

    /// Evict all expired entries. Returns how many were removed.
    pub fn sweep(&self, now: Millis) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_active(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Swept expired blocks");
        }
        removed
    }

    /// Entries held, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SQLI: BlockReason = BlockReason::Detection(SecurityEventType::SqlInjection);

    #[test]
    fn test_block_lifecycle() {
        let registry = BlockRegistry::new();
        registry.block("1.2.3.4", 1_000, SQLI, 0);

        assert!(registry.is_blocked("1.2.3.4", 500));
        assert_eq!(registry.remaining_ms("1.2.3.4", 500), Some(500));

        assert!(!registry.is_blocked("1.2.3.4", 1_500));
        assert_eq!(registry.len(), 0, "expired entry must be evicted on lookup");
    }

    #[test]
    fn test_expiry_boundary() {
        let registry = BlockRegistry::new();
        registry.block("a", 1_000, BlockReason::Manual, 0);
        assert!(registry.is_blocked("a", 999));
        assert!(!registry.is_blocked("a", 1_000));
    }

    #[test]
    fn test_reblock_overwrites_expiry() {
        let registry = BlockRegistry::new();
        registry.block("a", 1_000, BlockReason::Manual, 0);
        registry.block("a", 10_000, SQLI, 500);

        let entry = registry.get("a", 2_000).unwrap();
        assert_eq!(entry.expires_at_ms, 10_500);
        assert_eq!(entry.reason, SQLI);
    }

    #[test]
    fn test_sweep_and_listing() {
        let registry = BlockRegistry::new();
        registry.block("short", 100, BlockReason::Manual, 0);
        registry.block("long", 10_000, SQLI, 0);

        assert_eq!(registry.active_count(50), 2);
        assert_eq!(registry.sweep(1_000), 1);
        assert_eq!(registry.blocked_ids(1_000), vec!["long".to_string()]);
    }

    #[test]
    fn test_unblock() {
        let registry = BlockRegistry::new();
        registry.block("a", 10_000, BlockReason::Manual, 0);
        assert!(registry.unblock("a"));
        assert!(!registry.is_blocked("a", 1));
        assert!(!registry.unblock("a"));
    }

    #[test]
    fn test_concurrent_block_and_lookup() {
        let registry = Arc::new(BlockRegistry::new());
        let mut handles = vec![];

        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let id = format!("10.0.0.{}", i);
                registry.block(&id, 5_000, BlockReason::Manual, 0);
                assert!(registry.is_blocked(&id, 1_000));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.active_count(1_000), 8);
    }
}
