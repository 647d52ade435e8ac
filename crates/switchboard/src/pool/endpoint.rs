//! A single pooled backend endpoint: health, warmth, and its slot semaphore.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::backend::BackendClient;
use crate::config::PoolConfig;

/// Probe failures before an endpoint is marked down.
const DOWN_AFTER_FAILURES: u32 = 3;

/// Health state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Not yet probed.
    Unknown,
    /// Serving traffic.
    Healthy,
    /// Recent failures, still counted toward down.
    Degraded,
    /// Removed from selection until a probe succeeds.
    Down,
}

#[derive(Debug)]
struct Health {
    state: EndpointState,
    consecutive_failures: u32,
    last_probe: Option<Instant>,
}

/// A pooled backend endpoint.
pub struct Endpoint {
    client: Arc<dyn BackendClient>,
    gpu_id: Option<u32>,
    health: Mutex<Health>,
    warm: Mutex<HashSet<String>>,
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
}

impl Endpoint {
    /// Wrap a backend client as a pool endpoint.
    #[must_use]
    pub fn new(client: Arc<dyn BackendClient>, gpu_id: Option<u32>, config: &PoolConfig) -> Self {
        let max_parallel = config.max_parallel.max(1);
        Self {
            client,
            gpu_id,
            health: Mutex::new(Health {
                state: EndpointState::Unknown,
                consecutive_failures: 0,
                last_probe: None,
            }),
            warm: Mutex::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    /// The wrapped client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn BackendClient> {
        &self.client
    }

    /// Endpoint identity for logs and metrics.
    #[must_use]
    pub fn url(&self) -> &str {
        self.client.endpoint_url()
    }

    /// GPU the endpoint is pinned to, if any.
    #[must_use]
    pub fn gpu_id(&self) -> Option<u32> {
        self.gpu_id
    }

    /// Current health state.
    #[must_use]
    pub fn state(&self) -> EndpointState {
        self.health.lock().state
    }

    /// When the endpoint was last probed.
    #[must_use]
    pub fn last_probe(&self) -> Option<Instant> {
        self.health.lock().last_probe
    }

    /// Concurrent inferences currently admitted.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_parallel - self.semaphore.available_permits()
    }

    /// The slot semaphore (capacity `max_parallel`).
    #[must_use]
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// Whether `model` is warm on this endpoint.
    #[must_use]
    pub fn is_warm(&self, model: &str) -> bool {
        self.warm.lock().contains(model)
    }

    /// Record `model` as loaded.
    pub fn mark_warm(&self, model: &str) {
        self.warm.lock().insert(model.to_string());
    }

    /// One success flips the endpoint healthy.
    pub fn record_success(&self) {
        let mut health = self.health.lock();
        health.consecutive_failures = 0;
        health.state = EndpointState::Healthy;
    }

    /// Failures accumulate toward down. The warm set is cleared once the
    /// endpoint goes down since the daemon may have restarted.
    pub fn record_failure(&self) {
        let went_down = {
            let mut health = self.health.lock();
            health.consecutive_failures += 1;
            health.state = if health.consecutive_failures >= DOWN_AFTER_FAILURES {
                EndpointState::Down
            } else {
                EndpointState::Degraded
            };
            health.state == EndpointState::Down
        };
        if went_down {
            self.warm.lock().clear();
            tracing::warn!(endpoint = self.url(), "endpoint marked down");
        }
    }

    /// Run one health probe: a lightweight model listing, never a
    /// generation.
    pub async fn probe(&self) {
        let result = self.client.list_models().await;
        self.health.lock().last_probe = Some(Instant::now());
        match result {
            Ok(models) => {
                {
                    let mut warm = self.warm.lock();
                    warm.clear();
                    warm.extend(models);
                }
                self.record_success();
            }
            Err(e) => {
                tracing::debug!(endpoint = self.url(), error = %e, "health probe failed");
                self.record_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChunkStream, GenerateRequest, GenerateResponse};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyBackend {
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BackendClient for FlakyBackend {
        async fn generate(&self, _request: &GenerateRequest) -> Result<GenerateResponse> {
            Err(Error::Backend("unused".into()))
        }
        async fn generate_stream(&self, _request: &GenerateRequest) -> Result<ChunkStream> {
            Err(Error::Backend("unused".into()))
        }
        async fn list_models(&self) -> Result<Vec<String>> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Backend("probe refused".into()))
            } else {
                Ok(vec!["llama3.1:8b".into()])
            }
        }
        async fn load_model(&self, _model: &str) -> Result<()> {
            Ok(())
        }
        fn endpoint_url(&self) -> &str {
            "http://flaky"
        }
    }

    fn endpoint(fail: &Arc<AtomicBool>) -> Endpoint {
        Endpoint::new(
            Arc::new(FlakyBackend {
                fail: Arc::clone(fail),
            }),
            None,
            &PoolConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_three_failures_mark_down_one_success_restores() {
        let fail = Arc::new(AtomicBool::new(true));
        let ep = endpoint(&fail);
        assert_eq!(ep.state(), EndpointState::Unknown);
        ep.probe().await;
        assert_eq!(ep.state(), EndpointState::Degraded);
        ep.probe().await;
        assert_eq!(ep.state(), EndpointState::Degraded);
        ep.probe().await;
        assert_eq!(ep.state(), EndpointState::Down);

        fail.store(false, Ordering::SeqCst);
        ep.probe().await;
        assert_eq!(ep.state(), EndpointState::Healthy);
        assert!(ep.is_warm("llama3.1:8b"));
        assert!(ep.last_probe().is_some());
    }

    #[tokio::test]
    async fn test_warm_tracking() {
        let fail = Arc::new(AtomicBool::new(false));
        let ep = endpoint(&fail);
        assert!(!ep.is_warm("m"));
        ep.mark_warm("m");
        assert!(ep.is_warm("m"));
    }

    #[tokio::test]
    async fn test_down_clears_warm_set() {
        let fail = Arc::new(AtomicBool::new(true));
        let ep = endpoint(&fail);
        ep.mark_warm("m");
        ep.record_failure();
        ep.record_failure();
        assert!(ep.is_warm("m"));
        ep.record_failure();
        assert!(!ep.is_warm("m"));
    }

    #[tokio::test]
    async fn test_in_flight_follows_permits() {
        let fail = Arc::new(AtomicBool::new(false));
        let ep = endpoint(&fail);
        assert_eq!(ep.in_flight(), 0);
        let permit = Arc::clone(ep.semaphore()).try_acquire_owned().unwrap();
        assert_eq!(ep.in_flight(), 1);
        drop(permit);
        assert_eq!(ep.in_flight(), 0);
    }
}
