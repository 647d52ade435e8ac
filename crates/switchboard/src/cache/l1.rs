//! In-process L1 cache: LRU shards keyed by fingerprint top bits.
//!
//! Each shard is an `lru::LruCache` (hash map over a doubly-linked list, O(1)
//! get/put/evict) behind a short-critical-section `parking_lot::Mutex`.
//! Sharding by the fingerprint's top bits keeps lock contention low without
//! a global cache lock. The global count and byte caps are divided evenly
//! across shards, so the whole cache never exceeds either cap.

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use crate::cache::entry::CacheEntry;
use crate::config::CacheConfig;
use crate::fingerprint::Fingerprint;

struct Shard {
    entries: LruCache<String, CacheEntry>,
    bytes: usize,
}

impl Shard {
    fn evict_to_caps(&mut self, max_items: usize, max_bytes: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_items || self.bytes > max_bytes {
            match self.entries.pop_lru() {
                Some((_, old)) => {
                    self.bytes = self.bytes.saturating_sub(old.size_bytes());
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Bounded, sharded LRU cache.
pub struct ShardedLru {
    shards: Vec<Mutex<Shard>>,
    max_items_per_shard: usize,
    max_bytes_per_shard: usize,
}

impl ShardedLru {
    /// Build the cache from the configured global caps.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        let shard_count = config.shards.max(1).next_power_of_two().min(256);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                })
            })
            .collect();
        Self {
            shards,
            max_items_per_shard: (config.l1_max_items / shard_count).max(1),
            max_bytes_per_shard: (config.l1_max_bytes / shard_count).max(1),
        }
    }

    fn shard_for(&self, key: &Fingerprint) -> &Mutex<Shard> {
        &self.shards[key.shard(self.shards.len())]
    }

    /// Fetch an entry, refreshing its recency. Expired entries are dropped
    /// and read as misses.
    #[must_use]
    pub fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        let mut shard = self.shard_for(key).lock();
        let expired = match shard.entries.get(key.as_str()) {
            Some(entry) if entry.is_expired(Utc::now()) => true,
            Some(entry) => return Some(entry.clone()),
            None => return None,
        };
        if expired {
            if let Some(old) = shard.entries.pop(key.as_str()) {
                shard.bytes = shard.bytes.saturating_sub(old.size_bytes());
            }
        }
        None
    }

    /// Insert an entry, replacing any previous value under the key, then
    /// evict LRU-first until both shard caps hold.
    pub fn put(&self, key: &Fingerprint, entry: CacheEntry) {
        let size = entry.size_bytes();
        let mut shard = self.shard_for(key).lock();
        if let Some(old) = shard.entries.put(key.as_str().to_string(), entry) {
            shard.bytes = shard.bytes.saturating_sub(old.size_bytes());
        }
        shard.bytes += size;
        let evicted = shard.evict_to_caps(self.max_items_per_shard, self.max_bytes_per_shard);
        if evicted > 0 {
            tracing::trace!(evicted, "L1 shard evicted entries to caps");
        }
    }

    /// Remove an entry (used when L2 promotion finds a corrupted payload).
    pub fn remove(&self, key: &Fingerprint) {
        let mut shard = self.shard_for(key).lock();
        if let Some(old) = shard.entries.pop(key.as_str()) {
            shard.bytes = shard.bytes.saturating_sub(old.size_bytes());
        }
    }

    /// Total entries across shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes across shards.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }

    /// Per-shard entry cap (for tests and introspection).
    #[must_use]
    pub fn max_items_per_shard(&self) -> usize {
        self.max_items_per_shard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fp(text: &str) -> Fingerprint {
        use crate::types::{Request, RequestPayload, UserTier};
        crate::fingerprint::fingerprint_request(
            &Request::new(
                "u",
                UserTier::Free,
                RequestPayload::Chat {
                    history: vec![],
                    message: text.to_string(),
                },
            ),
            "chat",
        )
    }

    fn entry(bytes: usize) -> CacheEntry {
        CacheEntry::new(vec![0u8; bytes], "", Duration::from_secs(60), "test")
    }

    fn small_cache(items: usize, bytes: usize) -> ShardedLru {
        ShardedLru::new(&CacheConfig {
            l1_max_items: items,
            l1_max_bytes: bytes,
            shards: 1,
        })
    }

    #[test]
    fn test_put_get_round_trip() {
        let cache = small_cache(8, 1024);
        let key = fp("a");
        cache.put(&key, entry(10));
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_count_cap_enforced_lru_order() {
        let cache = small_cache(2, 10_000);
        let (a, b, c) = (fp("a"), fp("b"), fp("c"));
        cache.put(&a, entry(1));
        cache.put(&b, entry(1));
        // Touch `a` so `b` is the LRU victim.
        assert!(cache.get(&a).is_some());
        cache.put(&c, entry(1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn test_byte_cap_enforced() {
        let cache = small_cache(100, 100);
        for i in 0..10 {
            cache.put(&fp(&format!("k{i}")), entry(40));
        }
        assert!(cache.bytes() <= 100, "bytes={} over cap", cache.bytes());
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_replacement_does_not_leak_bytes() {
        let cache = small_cache(8, 10_000);
        let key = fp("a");
        cache.put(&key, entry(100));
        cache.put(&key, entry(10));
        assert_eq!(cache.len(), 1);
        assert!(cache.bytes() < 100);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = small_cache(8, 1024);
        let key = fp("a");
        cache.put(
            &key,
            CacheEntry::new(vec![1], "", Duration::ZERO, "test"),
        );
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);
    }
}
