//! Gateway configuration loaded from the environment.
//!
//! Every knob has a default that works for a single-node deployment with one
//! local inference daemon. Invalid values are [`Error::Configuration`] at
//! startup rather than panics at request time.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::UserTier;

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Backend endpoint URLs, comma separated in `BACKEND_ENDPOINTS`.
    pub backend_endpoints: Vec<String>,
    /// L2 cache URL (`CACHE_L2_URL`); `None` disables L2.
    pub cache_l2_url: Option<String>,
    /// Default model served by the primary routes (`DEFAULT_MODEL`).
    pub default_model: String,
    /// Small fallback model (`FALLBACK_MODEL`).
    pub fallback_model: String,
    /// End-to-end latency target in ms (`TARGET_RESPONSE_TIME_MS`).
    pub target_response_time_ms: u64,
    /// Cache sizing and TTL knobs.
    pub cache: CacheConfig,
    /// Rate-limiter knobs.
    pub rate: RateConfig,
    /// Budget-ledger knobs.
    pub budget: BudgetConfig,
    /// Router / bandit knobs.
    pub router: RouterConfig,
    /// Backend pool knobs.
    pub pool: PoolConfig,
    /// Streaming pacing floor in ms (`STREAM_CHUNK_MIN_MS`).
    pub stream_chunk_min_ms: u64,
}

/// L1 cache sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry-count cap across all shards (`CACHE_L1_MAX_ITEMS`).
    pub l1_max_items: usize,
    /// Byte cap across all shards (`CACHE_L1_MAX_BYTES`).
    pub l1_max_bytes: usize,
    /// Shard count; keyed by the top bits of the fingerprint.
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_items: 2048,
            l1_max_bytes: 64 * 1024 * 1024,
            shards: 16,
        }
    }
}

/// Sliding-window rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Default requests-per-minute cap (`RATE_LIMIT_PER_MINUTE_DEFAULT`).
    pub per_minute_default: u32,
    /// Global cap on tracked identifiers (`RATE_IDENT_MAX`).
    pub ident_max: usize,
    /// Idle time after which a bucket is reclaimed (`RATE_IDENT_TTL_SEC`).
    pub ident_ttl: Duration,
    /// Sweeper cadence.
    pub sweep_interval: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_minute_default: 20,
            ident_max: 100_000,
            ident_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl RateConfig {
    /// Requests-per-minute cap for a tier.
    #[must_use]
    pub fn cap_for(&self, tier: UserTier) -> u32 {
        match tier {
            UserTier::Anonymous | UserTier::Free => self.per_minute_default,
            UserTier::Pro => 120,
            UserTier::Enterprise => 600,
        }
    }
}

/// Monthly budget configuration.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Default monthly cap in spend units (`DEFAULT_MONTHLY_BUDGET`).
    pub default_monthly_cap: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_monthly_cap: 10.0,
        }
    }
}

/// Adaptive router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Weight of the sampled quality term in selection utility.
    pub w_quality: f64,
    /// Penalty coefficient on estimated cost in selection utility.
    pub c_cost: f64,
    /// Penalty coefficient on estimated latency (seconds) in utility.
    pub c_lat: f64,
    /// Reward weight of the success indicator.
    pub w_success: f64,
    /// Reward weight of normalized latency-within-target.
    pub w_latency: f64,
    /// Reward weight of normalized cost-under-ceiling.
    pub w_cost: f64,
    /// Reward weight of explicit user feedback, when present.
    pub w_feedback: f64,
    /// Probability of running a shadow evaluation (`SHADOW_RATE`).
    pub shadow_rate: f64,
    /// Cold-start alpha (`BANDIT_COLD_START_ALPHA`).
    pub cold_start_alpha: f64,
    /// Cold-start beta (`BANDIT_COLD_START_BETA`).
    pub cold_start_beta: f64,
    /// An arm unseen in this many decisions becomes eligible for forcing.
    pub exploration_window: u64,
    /// A stale arm is forced at most once per this many decisions.
    pub exploration_interval: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            w_quality: 1.0,
            c_cost: 0.5,
            c_lat: 0.1,
            w_success: 0.5,
            w_latency: 0.25,
            w_cost: 0.15,
            w_feedback: 0.10,
            shadow_rate: 0.0,
            cold_start_alpha: 1.0,
            cold_start_beta: 1.0,
            exploration_window: 200,
            exploration_interval: 50,
        }
    }
}

/// Backend pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent inferences per endpoint.
    pub max_parallel: usize,
    /// How long a caller waits for a pool slot before `NO_BACKEND`.
    pub queue_timeout: Duration,
    /// Queue depth beyond which new requests are rejected `OVERLOADED`.
    pub queue_high_watermark: usize,
    /// Health probe cadence.
    pub probe_interval: Duration,
    /// Idle gap allowed between stream chunks.
    pub stream_idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            queue_timeout: Duration::from_secs(5),
            queue_high_watermark: 32,
            probe_interval: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(45),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend_endpoints: vec!["http://localhost:11434".to_string()],
            cache_l2_url: None,
            default_model: "llama3.1:8b".to_string(),
            fallback_model: "phi3:mini".to_string(),
            target_response_time_ms: 5_000,
            cache: CacheConfig::default(),
            rate: RateConfig::default(),
            budget: BudgetConfig::default(),
            router: RouterConfig::default(),
            pool: PoolConfig::default(),
            stream_chunk_min_ms: 80,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a variable is present but does
    /// not parse as its expected type.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(endpoints) = read_var("BACKEND_ENDPOINTS")? {
            config.backend_endpoints = endpoints
                .split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if config.backend_endpoints.is_empty() {
                return Err(Error::Configuration(
                    "BACKEND_ENDPOINTS is set but contains no endpoints".to_string(),
                ));
            }
        }
        config.cache_l2_url = read_var("CACHE_L2_URL")?;
        if let Some(v) = read_parsed("DEFAULT_MONTHLY_BUDGET")? {
            config.budget.default_monthly_cap = v;
        }
        if let Some(v) = read_parsed("RATE_LIMIT_PER_MINUTE_DEFAULT")? {
            config.rate.per_minute_default = v;
        }
        if let Some(v) = read_parsed("TARGET_RESPONSE_TIME_MS")? {
            config.target_response_time_ms = v;
        }
        if let Some(v) = read_parsed::<f64>("SHADOW_RATE")? {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::Configuration(format!(
                    "SHADOW_RATE must be in [0, 1], got {v}"
                )));
            }
            config.router.shadow_rate = v;
        }
        if let Some(v) = read_parsed::<f64>("BANDIT_COLD_START_ALPHA")? {
            if v < 1.0 {
                return Err(Error::Configuration(format!(
                    "BANDIT_COLD_START_ALPHA must be >= 1, got {v}"
                )));
            }
            config.router.cold_start_alpha = v;
        }
        if let Some(v) = read_parsed::<f64>("BANDIT_COLD_START_BETA")? {
            if v < 1.0 {
                return Err(Error::Configuration(format!(
                    "BANDIT_COLD_START_BETA must be >= 1, got {v}"
                )));
            }
            config.router.cold_start_beta = v;
        }
        if let Some(v) = read_var("DEFAULT_MODEL")? {
            config.default_model = v;
        }
        if let Some(v) = read_var("FALLBACK_MODEL")? {
            config.fallback_model = v;
        }
        if let Some(v) = read_parsed("STREAM_CHUNK_MIN_MS")? {
            config.stream_chunk_min_ms = v;
        }
        if let Some(v) = read_parsed("CACHE_L1_MAX_ITEMS")? {
            config.cache.l1_max_items = v;
        }
        if let Some(v) = read_parsed("CACHE_L1_MAX_BYTES")? {
            config.cache.l1_max_bytes = v;
        }
        if let Some(v) = read_parsed("RATE_IDENT_MAX")? {
            config.rate.ident_max = v;
        }
        if let Some(v) = read_parsed::<u64>("RATE_IDENT_TTL_SEC")? {
            config.rate.ident_ttl = Duration::from_secs(v);
        }

        Ok(config)
    }
}

fn read_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Configuration(format!("failed to read {name}: {e}"))),
    }
}

fn read_parsed<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match read_var(name)? {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Configuration(format!("invalid {name}='{raw}': {e}"))),
        None => Ok(None),
    }
}
