//! The `switchboard` gateway binary.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use switchboard::cache::CacheStore;
use switchboard::{BackendClient, GatewayConfig};
use switchboard_ollama::OllamaBackend;
use switchboard_redis::RedisStore;
use switchboard_server::{build_orchestrator, router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    tracing::info!(
        endpoints = config.backend_endpoints.len(),
        l2 = config.cache_l2_url.is_some(),
        "starting switchboard"
    );

    let backends: Vec<Arc<dyn BackendClient>> = config
        .backend_endpoints
        .iter()
        .map(|url| {
            Arc::new(
                OllamaBackend::new(url)
                    .with_connect_timeout(std::time::Duration::from_secs(2)),
            ) as Arc<dyn BackendClient>
        })
        .collect();

    // L2 unavailability at startup degrades to L1-only instead of failing.
    let l2: Option<Arc<dyn CacheStore>> = match &config.cache_l2_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!(error = %e, "L2 cache unavailable, continuing L1-only");
                None
            }
        },
        None => None,
    };

    let (orchestrator, limiter, pool) = build_orchestrator(config, backends, l2)?;

    // Background maintenance: endpoint probes and rate-bucket sweeping.
    pool.probe_all().await;
    let _health_task = pool.spawn_health_loop();
    let _sweeper_task = limiter.spawn_sweeper();

    let app = router(AppState { orchestrator });
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "switchboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}
