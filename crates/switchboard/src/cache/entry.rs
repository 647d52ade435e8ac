//! Cache entry schema shared by L1 and L2.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A cached payload with its lifecycle metadata.
///
/// Entries are never updated in place; a write under an existing key
/// replaces the entry wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// MIME-ish tag describing the payload (`application/json` for
    /// serialized responses).
    pub content_type: String,
    /// Creation time; eviction ties break on the earliest.
    pub created_at: DateTime<Utc>,
    /// Expiry time; entries at or past this instant read as misses.
    pub expires_at: DateTime<Utc>,
    /// Which node produced the entry.
    pub source_tag: String,
}

impl CacheEntry {
    /// Build an entry expiring `ttl` from now.
    #[must_use]
    pub fn new(payload: Vec<u8>, content_type: &str, ttl: Duration, source_tag: &str) -> Self {
        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        Self {
            payload,
            content_type: content_type.to_string(),
            created_at,
            expires_at,
            source_tag: source_tag.to_string(),
        }
    }

    /// Serialize `value` as a JSON payload entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if serialization fails.
    pub fn from_json<T: Serialize>(value: &T, ttl: Duration, source_tag: &str) -> Result<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Error::Internal(format!("failed to serialize cache payload: {e}")))?;
        Ok(Self::new(payload, "application/json", ttl, source_tag))
    }

    /// Deserialize the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheDegraded`] for corrupted payloads, which callers
    /// treat as a miss.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::CacheDegraded(format!("corrupted cache payload: {e}")))
    }

    /// Payload size used against the L1 byte cap.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.payload.len() + self.content_type.len() + self.source_tag.len()
    }

    /// Whether the entry has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining time to live, zero when expired.
    #[must_use]
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}
