//! L2 cache store interface.
//!
//! The gateway talks to a remote key-value store through this trait so the
//! concrete client (Redis in `switchboard-redis`) stays out of the core.
//! Every method may fail with a transient error; the tiered cache treats
//! read failures as misses and write failures as skips, never failing the
//! request.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A remote key-value store with TTL semantics.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Remove `key`. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Short name for log lines.
    fn name(&self) -> &'static str {
        "l2"
    }
}

/// In-process `CacheStore` used by tests and single-node deployments
/// without an L2.
#[derive(Default)]
pub struct MemoryStore {
    entries: dashmap::DashMap<String, (Vec<u8>, std::time::Instant)>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        // Clone under the shard guard, remove only after releasing it.
        let hit = self
            .entries
            .get(key)
            .map(|pair| (pair.0.clone(), pair.1));
        match hit {
            Some((value, expires)) if expires > std::time::Instant::now() => Ok(Some(value)),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            (value.to_vec(), std::time::Instant::now() + ttl),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
