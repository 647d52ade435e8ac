// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Thompson-sampling state: one Beta(α,β) posterior per (route, bucket) arm.
//!
//! Arms start at the configured cold-start prior (α=β=1 by default, the
//! uniform prior) and persist for the process lifetime. Updates for one arm
//! are serialized by its lock and idempotent per outcome event id, so a
//! retried reward delivery cannot double-count; α and β never decrease.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use statrs::distribution::{Beta, ContinuousCDF};
use uuid::Uuid;

use crate::types::{ComplexityClass, TaskType};

/// Outcome event ids remembered per arm for idempotent updates.
const EVENT_MEMORY: usize = 64;

/// A learning bucket: requests of one task type and complexity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Bucket {
    /// Task type component.
    pub task: TaskType,
    /// Complexity component.
    pub complexity: ComplexityClass,
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.task.as_str(), self.complexity.as_str())
    }
}

/// Identity of a bandit arm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArmKey {
    /// Route name.
    pub route: String,
    /// Learning bucket.
    pub bucket: Bucket,
}

#[derive(Debug)]
struct ArmState {
    alpha: f64,
    beta: f64,
    pulls: u64,
    last_update: DateTime<Utc>,
    last_selected_decision: u64,
    recent_events: VecDeque<Uuid>,
}

/// A point-in-time view of one arm, for logs and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ArmSnapshot {
    /// Route name.
    pub route: String,
    /// Bucket label.
    pub bucket: String,
    /// Posterior alpha.
    pub alpha: f64,
    /// Posterior beta.
    pub beta: f64,
    /// Rewards observed.
    pub pulls: u64,
    /// Posterior mean α/(α+β).
    pub mean: f64,
}

/// Thompson-sampling arm store.
pub struct ThompsonBandit {
    arms: DashMap<ArmKey, Mutex<ArmState>>,
    cold_alpha: f64,
    cold_beta: f64,
}

impl ThompsonBandit {
    /// Build a bandit with the given cold-start prior (clamped to ≥ 1).
    #[must_use]
    pub fn new(cold_alpha: f64, cold_beta: f64) -> Self {
        Self {
            arms: DashMap::new(),
            cold_alpha: cold_alpha.max(1.0),
            cold_beta: cold_beta.max(1.0),
        }
    }

    /// Draw a Thompson sample `p ~ Beta(α, β)` for the arm, via the
    /// inverse CDF of a uniform draw. The open-interval uniform keeps the
    /// sample strictly inside (0, 1).
    #[must_use]
    pub fn sample(&self, key: &ArmKey) -> f64 {
        let (alpha, beta) = {
            let arm = self.arm(key);
            let state = arm.lock();
            (state.alpha, state.beta)
        };
        let uniform: f64 = rand::thread_rng().gen_range(1e-12..(1.0 - 1e-12));
        match Beta::new(alpha, beta) {
            Ok(dist) => dist.inverse_cdf(uniform).clamp(1e-12, 1.0 - 1e-12),
            // α, β ≥ 1 always; this is unreachable in practice.
            Err(_) => alpha / (alpha + beta),
        }
    }

    /// Posterior mean α/(α+β), the greedy (shadow) policy's score.
    #[must_use]
    pub fn mean(&self, key: &ArmKey) -> f64 {
        let arm = self.arm(key);
        let state = arm.lock();
        state.alpha / (state.alpha + state.beta)
    }

    /// Record that the arm was chosen in decision `decision_seq`.
    pub fn mark_selected(&self, key: &ArmKey, decision_seq: u64) {
        let arm = self.arm(key);
        arm.lock().last_selected_decision = decision_seq;
    }

    /// Decisions since the arm was last selected (`u64::MAX` if never).
    #[must_use]
    pub fn staleness(&self, key: &ArmKey, decision_seq: u64) -> u64 {
        let arm = self.arm(key);
        let last = arm.lock().last_selected_decision;
        if last == 0 {
            u64::MAX
        } else {
            decision_seq.saturating_sub(last)
        }
    }

    /// Apply reward `r ∈ [0,1]` for outcome `event_id`: `α += r`,
    /// `β += 1 − r`. Duplicate event ids are ignored.
    pub fn update(&self, key: &ArmKey, event_id: Uuid, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        let arm = self.arm(key);
        let mut state = arm.lock();
        if state.recent_events.contains(&event_id) {
            tracing::debug!(arm = %key.bucket, route = %key.route, %event_id, "duplicate reward ignored");
            return;
        }
        if state.recent_events.len() == EVENT_MEMORY {
            state.recent_events.pop_front();
        }
        state.recent_events.push_back(event_id);
        state.alpha += reward;
        state.beta += 1.0 - reward;
        state.pulls += 1;
        state.last_update = Utc::now();
    }

    /// Snapshot every arm.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ArmSnapshot> {
        self.arms
            .iter()
            .map(|entry| {
                let key = entry.key();
                let state = entry.value().lock();
                ArmSnapshot {
                    route: key.route.clone(),
                    bucket: key.bucket.to_string(),
                    alpha: state.alpha,
                    beta: state.beta,
                    pulls: state.pulls,
                    mean: state.alpha / (state.alpha + state.beta),
                }
            })
            .collect()
    }

    /// Current (α, β) of an arm.
    #[must_use]
    pub fn posterior(&self, key: &ArmKey) -> (f64, f64) {
        let arm = self.arm(key);
        let state = arm.lock();
        (state.alpha, state.beta)
    }

    fn arm(&self, key: &ArmKey) -> dashmap::mapref::one::Ref<'_, ArmKey, Mutex<ArmState>> {
        if let Some(existing) = self.arms.get(key) {
            return existing;
        }
        self.arms
            .entry(key.clone())
            .or_insert_with(|| {
                Mutex::new(ArmState {
                    alpha: self.cold_alpha,
                    beta: self.cold_beta,
                    pulls: 0,
                    last_update: Utc::now(),
                    last_selected_decision: 0,
                    recent_events: VecDeque::with_capacity(EVENT_MEMORY),
                })
            })
            .downgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(route: &str) -> ArmKey {
        ArmKey {
            route: route.to_string(),
            bucket: Bucket {
                task: TaskType::Chat,
                complexity: ComplexityClass::Standard,
            },
        }
    }

    #[test]
    fn test_cold_start_uniform_prior() {
        let bandit = ThompsonBandit::new(1.0, 1.0);
        assert_eq!(bandit.posterior(&key("a")), (1.0, 1.0));
    }

    #[test]
    fn test_update_moves_posterior_by_reward() {
        let bandit = ThompsonBandit::new(1.0, 1.0);
        let arm = key("a");
        bandit.update(&arm, Uuid::new_v4(), 0.75);
        let (alpha, beta) = bandit.posterior(&arm);
        assert!((alpha - 1.75).abs() < 1e-9);
        assert!((beta - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_update_is_idempotent_per_event() {
        let bandit = ThompsonBandit::new(1.0, 1.0);
        let arm = key("a");
        let event = Uuid::new_v4();
        bandit.update(&arm, event, 1.0);
        bandit.update(&arm, event, 1.0);
        let (alpha, beta) = bandit.posterior(&arm);
        assert!((alpha - 2.0).abs() < 1e-9);
        assert!((beta - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_beta_never_decrease() {
        let bandit = ThompsonBandit::new(1.0, 1.0);
        let arm = key("a");
        let (mut prev_alpha, mut prev_beta) = bandit.posterior(&arm);
        for i in 0..50 {
            bandit.update(&arm, Uuid::new_v4(), (i % 2) as f64);
            let (alpha, beta) = bandit.posterior(&arm);
            assert!(alpha >= prev_alpha);
            assert!(beta >= prev_beta);
            prev_alpha = alpha;
            prev_beta = beta;
        }
    }

    #[test]
    fn test_reward_clamped_to_unit_interval() {
        let bandit = ThompsonBandit::new(1.0, 1.0);
        let arm = key("a");
        bandit.update(&arm, Uuid::new_v4(), 7.0);
        let (alpha, beta) = bandit.posterior(&arm);
        assert!((alpha - 2.0).abs() < 1e-9);
        assert!((beta - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_samples_in_open_unit_interval() {
        let bandit = ThompsonBandit::new(1.0, 1.0);
        let arm = key("a");
        for _ in 0..200 {
            let p = bandit.sample(&arm);
            assert!(p > 0.0 && p < 1.0, "sample {p} out of (0,1)");
        }
    }

    #[test]
    fn test_staleness_tracking() {
        let bandit = ThompsonBandit::new(1.0, 1.0);
        let arm = key("a");
        assert_eq!(bandit.staleness(&arm, 100), u64::MAX);
        bandit.mark_selected(&arm, 40);
        assert_eq!(bandit.staleness(&arm, 100), 60);
    }

    #[test]
    fn test_concurrent_updates_lose_nothing() {
        use std::sync::Arc;
        let bandit = Arc::new(ThompsonBandit::new(1.0, 1.0));
        let arm = key("a");
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bandit = Arc::clone(&bandit);
                let arm = arm.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        bandit.update(&arm, Uuid::new_v4(), 1.0);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let (alpha, beta) = bandit.posterior(&arm);
        assert!((alpha - 801.0).abs() < 1e-6);
        assert!((beta - 1.0).abs() < 1e-6);
    }
}
