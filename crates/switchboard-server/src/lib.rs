//! HTTP surface for the Switchboard gateway.
//!
//! The router exposes the chat/search/research endpoints plus liveness,
//! readiness, and Prometheus metrics; `main.rs` wires configuration,
//! backends, and background tasks and serves it.

pub mod dto;
pub mod routes;

pub use routes::{router, AppState};

use std::sync::Arc;

use switchboard::cache::{CacheStore, TieredCache};
use switchboard::graph::NodeContext;
use switchboard::limits::{BudgetLedger, SlidingWindowLimiter};
use switchboard::metrics::GatewayMetrics;
use switchboard::pool::{BackendPool, Endpoint};
use switchboard::router::{AdaptiveRouter, RouteTable};
use switchboard::session::SessionStore;
use switchboard::{BackendClient, GatewayConfig, Orchestrator, Result};

/// Assemble the orchestrator from configuration and concrete backends.
///
/// Spawns no background tasks; callers start the health loop and limiter
/// sweeper themselves so tests stay deterministic.
///
/// # Errors
///
/// Propagates metric-registration failures.
pub fn build_orchestrator(
    config: GatewayConfig,
    backends: Vec<Arc<dyn BackendClient>>,
    l2: Option<Arc<dyn CacheStore>>,
) -> Result<(Arc<Orchestrator>, Arc<SlidingWindowLimiter>, Arc<BackendPool>)> {
    let config = Arc::new(config);
    let endpoints = backends
        .into_iter()
        .map(|backend| Arc::new(Endpoint::new(backend, None, &config.pool)))
        .collect();
    let pool = Arc::new(BackendPool::new(endpoints, config.pool.clone()));
    let router = Arc::new(AdaptiveRouter::new(
        RouteTable::defaults(&config.default_model, &config.fallback_model),
        config.router.clone(),
    ));
    let ctx = Arc::new(NodeContext {
        cache: Arc::new(TieredCache::new(&config.cache, l2)),
        router,
        pool: Arc::clone(&pool),
        providers: Vec::new(),
        sessions: Arc::new(SessionStore::default()),
        metrics: Arc::new(GatewayMetrics::new()?),
        config: Arc::clone(&config),
    });
    let limiter = Arc::new(SlidingWindowLimiter::new(config.rate.clone()));
    let ledger = Arc::new(BudgetLedger::new(config.budget.clone()));
    let orchestrator = Arc::new(Orchestrator::new(ctx, Arc::clone(&limiter), ledger));
    Ok((orchestrator, limiter, pool))
}
