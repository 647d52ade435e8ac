//! Adaptive route selection: Thompson sampling under hard constraints.
//!
//! A decision walks INIT → FILTER → SAMPLE → CHOOSE → (optionally SHADOW)
//! and later COMMIT (reward applied) or ABANDON (cancelled request, no
//! update). Filtering drops routes whose static metadata violates the
//! request's cost, quality, or latency constraints; each surviving arm
//! draws `p ~ Beta(α, β)` and the highest-utility arm wins:
//!
//! ```text
//! u = p · w_quality − c_cost · est_cost − c_lat · est_latency_secs
//! ```
//!
//! An exploration floor forces an arm unseen in the last
//! `exploration_window` decisions at most once per `exploration_interval`
//! decisions, so cold arms keep receiving signal. Shadow mode re-runs the
//! selection under the greedy posterior-mean policy and only logs what it
//! would have picked; production traffic is never affected.

mod bandit;
mod route;

pub use bandit::{ArmKey, ArmSnapshot, Bucket, ThompsonBandit};
pub use route::{LatencyClass, Route, RouteTable};

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::types::{ComplexityClass, Constraints, TaskType};

/// Keywords that bump a query into the detailed class.
const ANALYTICAL_MARKERS: [&str; 6] = [
    "explain", "analyze", "analyse", "research", "compare", "why",
];

/// Classify a query's complexity: word-count bands plus analytical
/// keywords.
#[must_use]
pub fn classify_complexity(text: &str) -> ComplexityClass {
    let words = text.split_whitespace().count();
    let lowered = text.to_lowercase();
    let analytical = ANALYTICAL_MARKERS.iter().any(|m| lowered.contains(m));
    if analytical || words > 40 {
        ComplexityClass::Detailed
    } else if words <= 6 {
        ComplexityClass::UltraFast
    } else {
        ComplexityClass::Standard
    }
}

/// Rough prompt-side token prediction for a piece of text; the backend
/// reports exact counts after the fact.
#[must_use]
pub fn predict_prompt_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * 1.3) as u64
}

/// Expected completion tokens for a complexity class.
#[must_use]
pub fn predict_completion_tokens(complexity: ComplexityClass) -> u64 {
    match complexity {
        ComplexityClass::UltraFast => 120,
        ComplexityClass::Standard => 400,
        ComplexityClass::Detailed => 900,
    }
}

/// Combined prompt + completion prediction, used for cost estimates and
/// candidate filtering before a request runs.
#[must_use]
pub fn predict_tokens(text: &str, complexity: ComplexityClass) -> u64 {
    predict_prompt_tokens(text) + predict_completion_tokens(complexity)
}

/// What a shadow evaluation would have picked.
#[derive(Debug, Clone)]
pub struct ShadowChoice {
    /// Route the greedy policy prefers.
    pub route: String,
    /// Its posterior mean.
    pub mean: f64,
    /// Whether it differs from the production choice.
    pub diverged: bool,
}

/// A committed-to route choice for one request.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// The chosen route.
    pub route: Route,
    /// The learning bucket.
    pub bucket: Bucket,
    /// Outcome event id; reward delivery is idempotent on it.
    pub event_id: Uuid,
    /// The Thompson sample that won.
    pub sampled_p: f64,
    /// The winning utility.
    pub utility: f64,
    /// Whether the exploration floor forced this arm.
    pub explored: bool,
    /// Shadow evaluation, when one ran.
    pub shadow: Option<ShadowChoice>,
    /// Predicted token count used for the cost estimate.
    pub predicted_tokens: u64,
}

impl RouteDecision {
    /// The arm this decision charges rewards to.
    #[must_use]
    pub fn arm_key(&self) -> ArmKey {
        ArmKey {
            route: self.route.name.clone(),
            bucket: self.bucket,
        }
    }
}

/// Everything the reward function needs from a finished request.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Did the request produce a non-degraded answer.
    pub success: bool,
    /// Observed end-to-end latency.
    pub latency_ms: u64,
    /// The latency target the request ran under.
    pub target_latency_ms: u64,
    /// Actual cost in spend units.
    pub cost: f64,
    /// The cost ceiling (constraint or route estimate).
    pub cost_ceiling: f64,
    /// Optional explicit user feedback in [0, 1].
    pub user_feedback: Option<f64>,
}

/// Thompson-sampling router over the route table.
pub struct AdaptiveRouter {
    table: RouteTable,
    bandit: ThompsonBandit,
    config: RouterConfig,
    decisions: AtomicU64,
    last_forced: AtomicU64,
}

impl AdaptiveRouter {
    /// Build a router.
    #[must_use]
    pub fn new(table: RouteTable, config: RouterConfig) -> Self {
        let bandit = ThompsonBandit::new(config.cold_start_alpha, config.cold_start_beta);
        Self {
            table,
            bandit,
            config,
            decisions: AtomicU64::new(0),
            last_forced: AtomicU64::new(0),
        }
    }

    /// The route table.
    #[must_use]
    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// The arm store (exposed for snapshots).
    #[must_use]
    pub fn bandit(&self) -> &ThompsonBandit {
        &self.bandit
    }

    /// Select a route for a request.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when no route satisfies the hard constraints.
    pub fn select(
        &self,
        task: TaskType,
        query_text: &str,
        constraints: &Constraints,
    ) -> Result<RouteDecision> {
        let complexity = classify_complexity(query_text);
        let predicted_tokens = predict_tokens(query_text, complexity);
        let bucket = Bucket { task, complexity };
        let decision_seq = self.decisions.fetch_add(1, Ordering::Relaxed) + 1;

        // FILTER
        let candidates = self.table.candidates(task, constraints, predicted_tokens);
        if candidates.is_empty() {
            return Err(Error::Validation(format!(
                "no route satisfies the constraints for {} requests",
                task.as_str()
            )));
        }

        // Exploration floor: force the stalest unseen arm, at most once per
        // exploration_interval decisions.
        let forced = self.pick_forced(&candidates, bucket, decision_seq);

        // SAMPLE + CHOOSE
        let mut best: Option<(f64, f64, &Route)> = None;
        for &route in &candidates {
            let key = ArmKey {
                route: route.name.clone(),
                bucket,
            };
            let p = self.bandit.sample(&key);
            let utility = self.utility(p, route, predicted_tokens);
            if best.map_or(true, |(u, _, _)| utility > u) {
                best = Some((utility, p, route));
            }
        }
        // candidates is non-empty, so `best` is always populated.
        let (mut utility, mut sampled_p, mut chosen) = best.unwrap_or((0.0, 0.5, candidates[0]));
        let mut explored = false;
        if let Some(forced_route) = forced {
            if forced_route.name != chosen.name {
                tracing::debug!(
                    route = %forced_route.name,
                    bucket = %bucket,
                    "exploration floor forcing stale arm"
                );
                chosen = forced_route;
                sampled_p = self.bandit.sample(&ArmKey {
                    route: chosen.name.clone(),
                    bucket,
                });
                utility = self.utility(sampled_p, chosen, predicted_tokens);
            }
            explored = true;
        }

        let key = ArmKey {
            route: chosen.name.clone(),
            bucket,
        };
        self.bandit.mark_selected(&key, decision_seq);

        // SHADOW: dry-run the greedy candidate policy, log only.
        let shadow = self.maybe_shadow(&candidates, bucket, chosen);

        Ok(RouteDecision {
            route: chosen.clone(),
            bucket,
            event_id: Uuid::new_v4(),
            sampled_p,
            utility,
            explored,
            shadow,
            predicted_tokens,
        })
    }

    /// COMMIT: fold the outcome into the chosen arm.
    pub fn commit(&self, decision: &RouteDecision, outcome: &RouteOutcome) {
        let reward = self.reward(outcome);
        self.bandit.update(&decision.arm_key(), decision.event_id, reward);
        tracing::debug!(
            route = %decision.route.name,
            bucket = %decision.bucket,
            reward,
            success = outcome.success,
            "bandit reward committed"
        );
    }

    /// ABANDON: a cancelled request updates nothing, by design the arm
    /// never learns from outcomes the user never saw.
    pub fn abandon(&self, decision: &RouteDecision) {
        tracing::debug!(
            route = %decision.route.name,
            bucket = %decision.bucket,
            "decision abandoned without update"
        );
    }

    /// Reward in [0, 1]: weighted mix of success, latency within target,
    /// cost under ceiling, and optional user feedback. Weights renormalize
    /// over the terms that are present.
    #[must_use]
    pub fn reward(&self, outcome: &RouteOutcome) -> f64 {
        let c = &self.config;
        let success = if outcome.success { 1.0 } else { 0.0 };
        let latency = if outcome.target_latency_ms > 0 {
            1.0 - (outcome.latency_ms as f64 / outcome.target_latency_ms as f64).min(1.0)
        } else {
            0.0
        };
        let cost = if outcome.cost_ceiling > 0.0 {
            1.0 - (outcome.cost / outcome.cost_ceiling).min(1.0)
        } else {
            0.0
        };

        let mut numerator =
            c.w_success * success + c.w_latency * latency + c.w_cost * cost;
        let mut denominator = c.w_success + c.w_latency + c.w_cost;
        if let Some(feedback) = outcome.user_feedback {
            numerator += c.w_feedback * feedback.clamp(0.0, 1.0);
            denominator += c.w_feedback;
        }
        if denominator <= 0.0 {
            return success;
        }
        (numerator / denominator).clamp(0.0, 1.0)
    }

    fn utility(&self, p: f64, route: &Route, predicted_tokens: u64) -> f64 {
        let est_cost = route.estimate_cost(predicted_tokens);
        let est_latency_secs = route.latency_class.approx_ms() as f64 / 1000.0;
        p * self.config.w_quality
            - self.config.c_cost * est_cost
            - self.config.c_lat * est_latency_secs
    }

    fn pick_forced<'a>(
        &self,
        candidates: &[&'a Route],
        bucket: Bucket,
        decision_seq: u64,
    ) -> Option<&'a Route> {
        let last = self.last_forced.load(Ordering::Relaxed);
        if decision_seq.saturating_sub(last) < self.config.exploration_interval {
            return None;
        }
        let stale = candidates
            .iter()
            .map(|route| {
                let key = ArmKey {
                    route: route.name.clone(),
                    bucket,
                };
                (self.bandit.staleness(&key, decision_seq), *route)
            })
            .filter(|(staleness, _)| *staleness > self.config.exploration_window)
            .max_by_key(|(staleness, _)| *staleness);
        match stale {
            Some((_, route)) => {
                self.last_forced.store(decision_seq, Ordering::Relaxed);
                Some(route)
            }
            None => None,
        }
    }

    fn maybe_shadow(
        &self,
        candidates: &[&Route],
        bucket: Bucket,
        chosen: &Route,
    ) -> Option<ShadowChoice> {
        if self.config.shadow_rate <= 0.0
            || rand::thread_rng().gen::<f64>() >= self.config.shadow_rate
        {
            return None;
        }
        let greedy = candidates.iter().max_by(|a, b| {
            let ma = self.bandit.mean(&ArmKey {
                route: a.name.clone(),
                bucket,
            });
            let mb = self.bandit.mean(&ArmKey {
                route: b.name.clone(),
                bucket,
            });
            ma.partial_cmp(&mb).unwrap_or(std::cmp::Ordering::Equal)
        })?;
        let mean = self.bandit.mean(&ArmKey {
            route: greedy.name.clone(),
            bucket,
        });
        let choice = ShadowChoice {
            route: greedy.name.clone(),
            mean,
            diverged: greedy.name != chosen.name,
        };
        tracing::info!(
            production = %chosen.name,
            shadow = %choice.route,
            shadow_mean = choice.mean,
            diverged = choice.diverged,
            "shadow policy evaluation"
        );
        Some(choice)
    }
}
