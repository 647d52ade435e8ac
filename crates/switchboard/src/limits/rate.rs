// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Sliding-window rate limiter with bounded memory.
//!
//! One bucket per identifier (user id or IP) holds the timestamps of
//! accepted requests inside the 60-second window. Checks for one identifier
//! are serialized by the bucket's lock; identifiers are independent. A
//! sweeper reclaims buckets idle past the configured TTL, and a global
//! identifier cap evicts the oldest idle buckets first so memory stays
//! bounded no matter how many unique identifiers appear.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::RateConfig;
use crate::error::{Error, Result};
use crate::types::UserTier;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct RateBucket {
    hits: VecDeque<Instant>,
    last_seen: Instant,
}

/// Sliding-window-log rate limiter.
pub struct SlidingWindowLimiter {
    buckets: DashMap<String, Mutex<RateBucket>>,
    config: RateConfig,
}

impl SlidingWindowLimiter {
    /// Build a limiter from configuration.
    #[must_use]
    pub fn new(config: RateConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Admit or reject a request for `identifier` at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] with the seconds until the oldest
    /// in-window request ages out.
    pub fn check(&self, identifier: &str, tier: UserTier, now: Instant) -> Result<()> {
        let cap = self.config.cap_for(tier) as usize;

        let bucket_ref = self.buckets.entry(identifier.to_string()).or_insert_with(|| {
            Mutex::new(RateBucket {
                hits: VecDeque::with_capacity(cap.min(64)),
                last_seen: now,
            })
        });
        let mut bucket = bucket_ref.lock();
        bucket.last_seen = now;

        while let Some(&oldest) = bucket.hits.front() {
            if now.duration_since(oldest) >= WINDOW {
                bucket.hits.pop_front();
            } else {
                break;
            }
        }

        if bucket.hits.len() >= cap {
            let oldest = bucket.hits.front().copied().unwrap_or(now);
            let retry_after = WINDOW.saturating_sub(now.duration_since(oldest));
            return Err(Error::RateLimited {
                retry_after_seconds: retry_after.as_secs().min(WINDOW.as_secs()).max(1),
            });
        }

        // The log never needs more than `cap` entries per identifier.
        bucket.hits.push_back(now);
        Ok(())
    }

    /// Reclaim idle buckets and enforce the global identifier cap.
    ///
    /// Runs on the sweeper cadence; also safe to call inline from tests.
    pub fn sweep(&self, now: Instant) {
        let ttl = self.config.ident_ttl;
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| now.duration_since(entry.value().lock().last_seen) > ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            // Re-check under removal so a just-refreshed bucket survives.
            self.buckets
                .remove_if(&key, |_, bucket| {
                    now.duration_since(bucket.lock().last_seen) > ttl
                });
        }

        let over = self.buckets.len().saturating_sub(self.config.ident_max);
        if over > 0 {
            let mut by_idle: Vec<(String, Instant)> = self
                .buckets
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().lock().last_seen))
                .collect();
            by_idle.sort_by_key(|(_, last_seen)| *last_seen);
            for (key, _) in by_idle.into_iter().take(over) {
                self.buckets.remove(&key);
            }
            tracing::debug!(evicted = over, "rate limiter evicted oldest idle buckets");
        }
    }

    /// Spawn the background sweeper task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = limiter.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                limiter.sweep(Instant::now());
            }
        })
    }

    /// Number of tracked identifiers.
    #[must_use]
    pub fn tracked_identifiers(&self) -> usize {
        self.buckets.len()
    }
}
