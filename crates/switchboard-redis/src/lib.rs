//! Redis-backed L2 cache store for Switchboard.
//!
//! Implements the core's [`CacheStore`] contract over a shared Redis: GET,
//! SET with TTL, and DEL. Connection management uses the async
//! `ConnectionManager`, which reconnects under the covers; request paths
//! treat any error here as a degraded cache, never a failed request.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use switchboard::cache::CacheStore;
use switchboard::error::{Error, Result};

/// Key prefix separating gateway entries from other tenants of the store.
const KEY_PREFIX: &str = "swb:cache:";

/// A `CacheStore` over Redis.
pub struct RedisStore {
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://localhost:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the URL is invalid or the
    /// initial connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid Redis URL: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Configuration(format!("Redis connection failed: {e}")))?;
        tracing::info!(url, "connected to L2 cache");
        Ok(Self { manager })
    }

    fn key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        conn.get::<_, Option<Vec<u8>>>(Self::key(key))
            .await
            .map_err(|e| Error::CacheDegraded(format!("L2 GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let ttl_secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(Self::key(key), value, ttl_secs)
            .await
            .map_err(|e| Error::CacheDegraded(format!("L2 SET failed: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(Self::key(key))
            .await
            .map_err(|e| Error::CacheDegraded(format!("L2 DEL failed: {e}")))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
