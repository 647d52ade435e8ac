//! Prometheus counters and histograms for the gateway.
//!
//! Constructed once at startup against a registry and passed explicitly to
//! the components that record into it; the `/metrics` endpoint renders the
//! registry in text exposition format.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// All gateway metrics, registered against one registry.
pub struct GatewayMetrics {
    registry: Registry,
    /// Requests by task type and outcome label.
    pub requests_total: IntCounterVec,
    /// Cache hits by level (l1/l2).
    pub cache_hits_total: IntCounterVec,
    /// Cache misses.
    pub cache_misses_total: IntCounterVec,
    /// Rate-limit rejections by tier.
    pub rate_limited_total: IntCounterVec,
    /// Budget rejections.
    pub budget_rejected_total: IntCounterVec,
    /// Backend failures by error kind.
    pub backend_errors_total: IntCounterVec,
    /// Fallback-chain advances by from-route.
    pub fallbacks_total: IntCounterVec,
    /// End-to-end latency by task type, seconds.
    pub request_latency_seconds: HistogramVec,
    /// Backend call latency by model, seconds.
    pub backend_latency_seconds: HistogramVec,
    /// Tokens consumed by direction (prompt/completion).
    pub tokens_total: IntCounterVec,
    /// Reward values committed to the bandit.
    pub bandit_reward: Histogram,
    /// Healthy endpoints right now.
    pub healthy_endpoints: IntGauge,
}

impl GatewayMetrics {
    /// Register every metric against a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if registration fails (duplicate names).
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("switchboard_requests_total", "Requests by task and outcome"),
            &["task", "outcome"],
        )
        .map_err(internal)?;
        let cache_hits_total = IntCounterVec::new(
            Opts::new("switchboard_cache_hits_total", "Cache hits by level"),
            &["level"],
        )
        .map_err(internal)?;
        let cache_misses_total = IntCounterVec::new(
            Opts::new("switchboard_cache_misses_total", "Cache misses by task"),
            &["task"],
        )
        .map_err(internal)?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new("switchboard_rate_limited_total", "Rate-limit rejections"),
            &["tier"],
        )
        .map_err(internal)?;
        let budget_rejected_total = IntCounterVec::new(
            Opts::new("switchboard_budget_rejected_total", "Budget rejections"),
            &["tier"],
        )
        .map_err(internal)?;
        let backend_errors_total = IntCounterVec::new(
            Opts::new("switchboard_backend_errors_total", "Backend failures by kind"),
            &["kind"],
        )
        .map_err(internal)?;
        let fallbacks_total = IntCounterVec::new(
            Opts::new("switchboard_fallbacks_total", "Fallback advances by route"),
            &["from"],
        )
        .map_err(internal)?;
        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "switchboard_request_latency_seconds",
                "End-to-end request latency",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["task"],
        )
        .map_err(internal)?;
        let backend_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "switchboard_backend_latency_seconds",
                "Backend call latency",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0, 120.0]),
            &["model"],
        )
        .map_err(internal)?;
        let tokens_total = IntCounterVec::new(
            Opts::new("switchboard_tokens_total", "Tokens by direction"),
            &["direction"],
        )
        .map_err(internal)?;
        let bandit_reward = Histogram::with_opts(
            HistogramOpts::new("switchboard_bandit_reward", "Committed bandit rewards")
                .buckets(vec![0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0]),
        )
        .map_err(internal)?;
        let healthy_endpoints = IntGauge::new(
            "switchboard_healthy_endpoints",
            "Backend endpoints currently healthy",
        )
        .map_err(internal)?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(budget_rejected_total.clone()),
            Box::new(backend_errors_total.clone()),
            Box::new(fallbacks_total.clone()),
            Box::new(request_latency_seconds.clone()),
            Box::new(backend_latency_seconds.clone()),
            Box::new(tokens_total.clone()),
            Box::new(bandit_reward.clone()),
            Box::new(healthy_endpoints.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            requests_total,
            cache_hits_total,
            cache_misses_total,
            rate_limited_total,
            budget_rejected_total,
            backend_errors_total,
            fallbacks_total,
            request_latency_seconds,
            backend_latency_seconds,
            tokens_total,
            bandit_reward,
            healthy_endpoints,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if encoding fails.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(internal)
    }
}

fn internal(e: impl std::fmt::Display) -> Error {
    Error::Internal(format!("metrics error: {e}"))
}
