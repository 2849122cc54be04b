//! Keyed sliding-window event counter
//!
//! Shared by brute-force detection (`ip|endpoint` keys) and tiered rate
//! limiting (`ip|tier` keys). Pruning is lazy on read; [`WindowCounter::sweep`]
//! bounds memory for keys that are never read again.
//!
//! Each key lives in one DashMap shard entry, so concurrent increments on the
//! same key are serialized and never lost.

use dashmap::DashMap;
use std::collections::VecDeque;

use crate::clock::Millis;

/// Number of shards for DashMap (power of 2 for efficient hashing)
const NUM_SHARDS: usize = 32;

#[derive(Debug)]
pub struct WindowCounter {
    entries: DashMap<String, VecDeque<Millis>>,
}

impl WindowCounter {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_capacity_and_shard_amount(1024, NUM_SHARDS),
        }
    }

    /// Compose a `client|classifier` key
    pub fn key(client: &str, classifier: &str) -> String {
        let mut key = String::with_capacity(client.len() + classifier.len() + 1);
        key.push_str(client);
        key.push('|');
        key.push_str(classifier);
        key
    }

    /// Append `now` to the key's sequence
    pub fn record(&self, key: &str, now: Millis) {
        if let Some(mut stamps) = self.entries.get_mut(key) {
            push_ordered(&mut stamps, now);
            return;
        }
        let mut stamps = self.entries.entry(key.to_string()).or_default();
        push_ordered(&mut stamps, now);
    }

    /// Count events within `window_ms` of `now`, pruning older ones first.
    /// A key left empty is removed.
    pub fn count(&self, key: &str, now: Millis, window_ms: Millis) -> usize {
        let count = match self.entries.get_mut(key) {
            Some(mut stamps) => {
                prune_front(&mut stamps, now, window_ms);
                stamps.len()
            }
            None => return 0,
        };

        if count == 0 {
            self.entries.remove_if(key, |_, stamps| stamps.is_empty());
        }
        count
    }

    /// Record and count under a single entry lock
    pub fn record_and_count(&self, key: &str, now: Millis, window_ms: Millis) -> usize {
        let mut stamps = self.entries.entry(key.to_string()).or_default();
        prune_front(&mut stamps, now, window_ms);
        push_ordered(&mut stamps, now);
        stamps.len()
    }

    /// Record only while fewer than `limit` events sit in the window.
    /// `Ok(count)` after recording, `Err(oldest)` when the quota is spent.
    pub fn record_within(
        &self,
        key: &str,
        now: Millis,
        window_ms: Millis,
        limit: usize,
    ) -> Result<usize, Millis> {
        let mut stamps = self.entries.entry(key.to_string()).or_default();
        prune_front(&mut stamps, now, window_ms);
        if stamps.len() >= limit {
            return Err(stamps.front().copied().unwrap_or(now));
        }
        push_ordered(&mut stamps, now);
        Ok(stamps.len())
    }

    /// Oldest timestamp still inside the window
    pub fn oldest(&self, key: &str, now: Millis, window_ms: Millis) -> Option<Millis> {
        let mut stamps = self.entries.get_mut(key)?;
        prune_front(&mut stamps, now, window_ms);
        stamps.front().copied()
    }

    /// Drop expired timestamps for one key, evicting it if empty
    pub fn prune(&self, key: &str, now: Millis, window_ms: Millis) {
        self.count(key, now, window_ms);
    }

    /// Prune every key and evict the empty ones. Returns evicted key count.
    pub fn sweep(&self, now: Millis, window_ms: Millis) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, stamps| {
            prune_front(stamps, now, window_ms);
            !stamps.is_empty()
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for WindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The window is `(now - window_ms, now]`: a stamp exactly `window_ms` old is gone
#[inline]
fn prune_front(stamps: &mut VecDeque<Millis>, now: Millis, window_ms: Millis) {
    while let Some(&front) = stamps.front() {
        if front.saturating_add(window_ms) <= now {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

/// Keep the sequence ordered even if callers report slightly stale times
#[inline]
fn push_ordered(stamps: &mut VecDeque<Millis>, at: Millis) {
    match stamps.back() {
        Some(&last) if last > at => {
            let idx = stamps.partition_point(|&t| t <= at);
            stamps.insert(idx, at);
        }
        _ => stamps.push_back(at),
    }
}
