// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Two-tier response cache.
//!
//! L1 is an in-process sharded LRU; L2 is a remote key-value store behind
//! the [`CacheStore`] trait. Reads check L1, then L2 (promoting hits);
//! writes go through to both. L2 unavailability downgrades the gateway to
//! L1-only, logged and never surfaced to callers. Concurrent misses on one
//! key are collapsed by [`SingleFlight`] so exactly one producer runs.

mod entry;
mod l1;
mod single_flight;
mod store;

pub use entry::CacheEntry;
pub use l1::ShardedLru;
pub use single_flight::{Flight, LeaderGuard, SingleFlight};
pub use store::{CacheStore, MemoryStore};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::types::{ComplexityClass, TaskType};

/// TTL for a cache entry, by task type and complexity class.
///
/// Search results expire fast because freshness matters more than hit rate;
/// chat and research TTLs scale inversely with complexity.
#[must_use]
pub fn ttl_for(task: TaskType, complexity: ComplexityClass) -> Duration {
    match (task, complexity) {
        (TaskType::Search, _) => Duration::from_secs(900),
        (_, ComplexityClass::UltraFast) => Duration::from_secs(7200),
        (_, ComplexityClass::Standard) => Duration::from_secs(3600),
        (_, ComplexityClass::Detailed) => Duration::from_secs(1800),
    }
}

/// The two-tier cache facade used by graph nodes.
pub struct TieredCache {
    l1: ShardedLru,
    l2: Option<Arc<dyn CacheStore>>,
    flight: SingleFlight,
}

impl TieredCache {
    /// Build a cache with an optional L2 store.
    #[must_use]
    pub fn new(config: &CacheConfig, l2: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            l1: ShardedLru::new(config),
            l2,
            flight: SingleFlight::new(),
        }
    }

    /// L1-only cache (tests, deployments without an L2).
    #[must_use]
    pub fn l1_only(config: &CacheConfig) -> Self {
        Self::new(config, None)
    }

    /// Look up `key`, consulting L1 then L2 and promoting L2 hits.
    pub async fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        self.get_labeled(key).await.map(|(entry, _)| entry)
    }

    /// Like [`TieredCache::get`], also reporting which tier served the hit.
    pub async fn get_labeled(&self, key: &Fingerprint) -> Option<(CacheEntry, &'static str)> {
        if let Some(entry) = self.l1.get(key) {
            return Some((entry, "l1"));
        }
        let l2 = self.l2.as_ref()?;
        match l2.get(key.as_str()).await {
            Ok(Some(bytes)) => match bincode::deserialize::<CacheEntry>(&bytes) {
                Ok(entry) if !entry.is_expired(Utc::now()) => {
                    self.l1.put(key, entry.clone());
                    Some((entry, "l2"))
                }
                Ok(_) => None,
                Err(e) => {
                    // Corrupted payload: discard and treat as a miss.
                    tracing::warn!(store = l2.name(), key = %key, error = %e, "discarding corrupted L2 entry");
                    let _ = l2.delete(key.as_str()).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(store = l2.name(), error = %e, "L2 read failed, degrading to L1-only");
                None
            }
        }
    }

    /// Write an entry to L1 and, best-effort, to L2.
    pub async fn put(&self, key: &Fingerprint, entry: CacheEntry) {
        let remaining = entry.remaining_ttl(Utc::now());
        self.l1.put(key, entry.clone());
        if let Some(l2) = &self.l2 {
            if remaining.is_zero() {
                return;
            }
            match bincode::serialize(&entry) {
                Ok(bytes) => {
                    if let Err(e) = l2.set(key.as_str(), &bytes, remaining).await {
                        tracing::warn!(store = l2.name(), error = %e, "L2 write skipped");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize entry for L2");
                }
            }
        }
    }

    /// Join the single-flight for `key` directly. The graph's CacheLookup
    /// node uses this on a miss: followers wait for the in-flight producer,
    /// while the leader carries the guard through its pipeline and completes
    /// it when the answer is stored (or fails).
    pub fn join_flight(&self, key: &Fingerprint) -> Flight {
        self.flight.join(key.as_str())
    }

    /// Get `key` or run `producer` under single-flight: with N concurrent
    /// misses, the producer runs once and all callers receive its result or
    /// its error.
    pub async fn get_or_produce<F, Fut>(
        &self,
        key: &Fingerprint,
        producer: F,
    ) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry>>,
    {
        if let Some(entry) = self.get(key).await {
            return Ok(entry);
        }
        match self.flight.join(key.as_str()) {
            Flight::Follower(rx) => rx.await.unwrap_or(Err(crate::error::Error::Cancelled)),
            Flight::Leader(guard) => {
                // A prior leader may have filled the cache between our miss
                // and taking the flight.
                if let Some(entry) = self.get(key).await {
                    let result = Ok(entry);
                    guard.complete(&result);
                    return result;
                }
                let result = producer().await;
                if let Ok(entry) = &result {
                    self.put(key, entry.clone()).await;
                }
                guard.complete(&result);
                result
            }
        }
    }

    /// L1 entry count.
    #[must_use]
    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    /// L1 payload bytes.
    #[must_use]
    pub fn l1_bytes(&self) -> usize {
        self.l1.bytes()
    }

    /// Whether an L2 store is configured.
    #[must_use]
    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }
}
