//! Immutable route descriptors and the route table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Constraints, QualityLevel, TaskType};

/// Approximate latency band of a route, compared against
/// `max_latency_ms` during candidate filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    /// Sub-second-ish small models.
    Fast,
    /// Mid-size models.
    Standard,
    /// Large models and critic loops.
    Slow,
}

impl LatencyClass {
    /// Upper bound of the band in milliseconds, used for filtering and the
    /// latency penalty in selection utility.
    #[must_use]
    pub fn approx_ms(&self) -> u64 {
        match self {
            Self::Fast => 1_500,
            Self::Standard => 6_000,
            Self::Slow => 20_000,
        }
    }
}

/// A logical route: a named mapping to a concrete model plus static
/// metadata. Routes are immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Logical name, unique within the table.
    pub name: String,
    /// Model served by the backend daemon.
    pub model: String,
    /// Tasks the route serves.
    pub task: TaskType,
    /// Latency band.
    pub latency_class: LatencyClass,
    /// Cost per 1 000 tokens in spend units.
    pub cost_per_1k_tokens: f64,
    /// Quality band.
    pub quality: QualityLevel,
    /// Ordered fallback route names, tried at most once per request.
    pub fallbacks: Vec<String>,
}

impl Route {
    /// Estimated cost of a call expected to consume `tokens` tokens.
    #[must_use]
    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        (tokens as f64 / 1000.0) * self.cost_per_1k_tokens
    }
}

/// The immutable set of routes the router selects from.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    by_name: HashMap<String, usize>,
}

impl RouteTable {
    /// Build a table, indexing routes by name. Later duplicates are
    /// rejected.
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        let mut by_name = HashMap::with_capacity(routes.len());
        for (idx, route) in routes.iter().enumerate() {
            by_name.insert(route.name.clone(), idx);
        }
        Self { routes, by_name }
    }

    /// The built-in table: a primary and a fallback chat route per the
    /// configured models, plus search and research synthesis routes and the
    /// research critic.
    #[must_use]
    pub fn defaults(default_model: &str, fallback_model: &str) -> Self {
        let routes = vec![
            Route {
                name: "chat-primary".into(),
                model: default_model.into(),
                task: TaskType::Chat,
                latency_class: LatencyClass::Standard,
                cost_per_1k_tokens: 0.004,
                quality: QualityLevel::Standard,
                fallbacks: vec!["chat-lite".into()],
            },
            Route {
                name: "chat-lite".into(),
                model: fallback_model.into(),
                task: TaskType::Chat,
                latency_class: LatencyClass::Fast,
                cost_per_1k_tokens: 0.001,
                quality: QualityLevel::Low,
                fallbacks: vec![],
            },
            Route {
                name: "search-synthesis".into(),
                model: default_model.into(),
                task: TaskType::Search,
                latency_class: LatencyClass::Standard,
                cost_per_1k_tokens: 0.004,
                quality: QualityLevel::Standard,
                fallbacks: vec!["search-lite".into()],
            },
            Route {
                name: "search-lite".into(),
                model: fallback_model.into(),
                task: TaskType::Search,
                latency_class: LatencyClass::Fast,
                cost_per_1k_tokens: 0.001,
                quality: QualityLevel::Low,
                fallbacks: vec![],
            },
            Route {
                name: "research-synthesis".into(),
                model: default_model.into(),
                task: TaskType::Research,
                latency_class: LatencyClass::Slow,
                cost_per_1k_tokens: 0.004,
                quality: QualityLevel::High,
                fallbacks: vec!["research-lite".into()],
            },
            Route {
                name: "research-lite".into(),
                model: fallback_model.into(),
                task: TaskType::Research,
                latency_class: LatencyClass::Standard,
                cost_per_1k_tokens: 0.001,
                quality: QualityLevel::Standard,
                fallbacks: vec![],
            },
            Route {
                name: "research-critic".into(),
                model: fallback_model.into(),
                task: TaskType::Research,
                latency_class: LatencyClass::Fast,
                cost_per_1k_tokens: 0.001,
                quality: QualityLevel::Standard,
                fallbacks: vec![],
            },
        ];
        Self::new(routes)
    }

    /// Look up a route by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Route> {
        self.by_name.get(name).map(|&idx| &self.routes[idx])
    }

    /// All routes.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Routes serving `task` whose static metadata satisfies the hard
    /// constraints: per-token cost within the implied budget, quality at or
    /// above the floor, latency band within the target.
    #[must_use]
    pub fn candidates(
        &self,
        task: TaskType,
        constraints: &Constraints,
        predicted_tokens: u64,
    ) -> Vec<&Route> {
        self.routes
            .iter()
            .filter(|r| r.task == task)
            .filter(|r| {
                constraints
                    .max_cost
                    .map_or(true, |ceiling| r.estimate_cost(predicted_tokens) <= ceiling)
            })
            .filter(|r| {
                constraints
                    .quality
                    .map_or(true, |floor| r.quality >= floor)
            })
            .filter(|r| {
                constraints
                    .max_latency_ms
                    .map_or(true, |max| r.latency_class.approx_ms() <= max)
            })
            .collect()
    }

    /// The next untried fallback of `route`, if any.
    #[must_use]
    pub fn next_fallback(&self, route: &Route, already_tried: &[String]) -> Option<&Route> {
        route
            .fallbacks
            .iter()
            .find(|name| !already_tried.contains(name))
            .and_then(|name| self.get(name))
    }
}
