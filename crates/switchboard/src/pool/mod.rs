//! Backend pool manager.
//!
//! Tracks N inference endpoints with health states, serializes invocations
//! per endpoint through a semaphore of `max_parallel` permits, warms models
//! on first use, and enforces task-class timeouts. Selection order for a
//! model: healthy endpoints with the model already warm, then the healthy
//! endpoint with the fewest in-flight calls, then wait up to the queue
//! timeout, then `NO_BACKEND`.
//!
//! The health probe is a `tags` listing, never a full generation; three
//! consecutive failures mark an endpoint down, a single success restores it.

mod endpoint;

pub use endpoint::{Endpoint, EndpointState};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::OwnedSemaphorePermit;

use crate::backend::{ChunkStream, GenerateRequest, GenerateResponse};
use crate::cancel::CancelToken;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::types::{ComplexityClass, TaskType};

/// Timeout class of a backend call, derived from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Trivial chat turns.
    Simple,
    /// Typical chat/search synthesis.
    Standard,
    /// Analytical synthesis.
    Complex,
    /// Research synthesis and critique.
    Research,
}

impl TaskClass {
    /// Derive the class from task type and complexity.
    #[must_use]
    pub fn for_request(task: TaskType, complexity: ComplexityClass) -> Self {
        match (task, complexity) {
            (TaskType::Research, _) => Self::Research,
            (_, ComplexityClass::UltraFast) => Self::Simple,
            (_, ComplexityClass::Standard) => Self::Standard,
            (_, ComplexityClass::Detailed) => Self::Complex,
        }
    }

    /// Buffered-call timeout for this class.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Simple => Duration::from_secs(15),
            Self::Standard => Duration::from_secs(30),
            Self::Complex => Duration::from_secs(60),
            Self::Research => Duration::from_secs(120),
        }
    }
}

/// A completed pool invocation.
#[derive(Debug, Clone)]
pub struct PoolReply {
    /// The generation result.
    pub response: GenerateResponse,
    /// Endpoint that served the call.
    pub endpoint_url: String,
    /// Wall-clock latency of the backend call.
    pub latency: Duration,
}

/// A leased streaming invocation. The permit rides with the stream so the
/// endpoint slot frees exactly when the stream is dropped or exhausted.
pub struct PoolStream {
    /// Chunk stream from the backend.
    pub chunks: ChunkStream,
    /// Endpoint that serves the stream.
    pub endpoint_url: String,
    _permit: OwnedSemaphorePermit,
}

/// Health-checked, pool-serialized access to backend endpoints.
pub struct BackendPool {
    endpoints: Vec<Arc<Endpoint>>,
    config: PoolConfig,
    queued: AtomicUsize,
}

impl BackendPool {
    /// Build a pool over the given endpoints.
    #[must_use]
    pub fn new(endpoints: Vec<Arc<Endpoint>>, config: PoolConfig) -> Self {
        Self {
            endpoints,
            config,
            queued: AtomicUsize::new(0),
        }
    }

    /// Endpoints currently marked healthy.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|e| e.state() == EndpointState::Healthy)
            .count()
    }

    /// Callers currently waiting for a slot; compared against the high
    /// watermark for `OVERLOADED` backpressure.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Whether admission should reject with `OVERLOADED`.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.queue_depth() >= self.config.queue_high_watermark
    }

    /// Ensure `model` is loaded somewhere; called on first route use.
    pub async fn warm_up(&self, model: &str) -> Result<()> {
        let candidate = self
            .usable_endpoints()
            .into_iter()
            .min_by_key(|e| e.in_flight())
            .ok_or_else(|| Error::NoBackend {
                model: model.to_string(),
            })?;
        if candidate.is_warm(model) {
            return Ok(());
        }
        tracing::info!(endpoint = candidate.url(), model, "warming model");
        candidate.client().load_model(model).await?;
        candidate.mark_warm(model);
        Ok(())
    }

    /// Run a buffered generation under the class timeout.
    ///
    /// # Errors
    ///
    /// `NO_BACKEND` when no endpoint can take the call within the queue
    /// timeout, `BACKEND_TIMEOUT` when the class deadline elapses, and the
    /// backend's own error otherwise. Cancellation aborts the call and
    /// releases the slot immediately.
    pub async fn invoke(
        &self,
        request: &GenerateRequest,
        class: TaskClass,
        cancel: &CancelToken,
    ) -> Result<PoolReply> {
        cancel.check()?;
        let (endpoint, permit) = self.acquire(&request.model).await?;
        cancel.check()?;

        let started = std::time::Instant::now();
        let timeout = class.timeout();
        let call = endpoint.client().generate(request);

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::BackendTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        };
        drop(permit);

        // Endpoint health is governed by the probe loop, not by request
        // outcomes; a slow generation must not take an endpoint out of
        // rotation.
        match outcome {
            Ok(response) => {
                endpoint.mark_warm(&request.model);
                Ok(PoolReply {
                    response,
                    endpoint_url: endpoint.url().to_string(),
                    latency: started.elapsed(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Start a streaming generation. Chunks inherit the idle timeout: a gap
    /// longer than `stream_idle_timeout` between chunks fails the stream.
    pub async fn invoke_stream(
        &self,
        request: &GenerateRequest,
        cancel: &CancelToken,
    ) -> Result<PoolStream> {
        cancel.check()?;
        let (endpoint, permit) = self.acquire(&request.model).await?;
        cancel.check()?;

        let raw = endpoint.client().generate_stream(request).await?;
        endpoint.mark_warm(&request.model);

        let idle = self.config.stream_idle_timeout;
        let cancel = cancel.clone();
        let guarded = async_stream::stream! {
            let mut raw = raw;
            loop {
                if cancel.is_cancelled() {
                    yield Err(Error::Cancelled);
                    break;
                }
                let next = tokio::select! {
                    () = cancel.cancelled() => Some(Err(Error::Cancelled)),
                    item = tokio::time::timeout(idle, raw.next()) => match item {
                        Ok(inner) => inner,
                        Err(_) => Some(Err(Error::BackendTimeout {
                            timeout_ms: idle.as_millis() as u64,
                        })),
                    },
                };
                match next {
                    Some(Ok(chunk)) => {
                        let done = chunk.done;
                        yield Ok(chunk);
                        if done {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                    None => break,
                }
            }
        };

        Ok(PoolStream {
            chunks: Box::pin(guarded),
            endpoint_url: endpoint.url().to_string(),
            _permit: permit,
        })
    }

    /// Background health loop probing every endpoint on the configured
    /// cadence.
    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.probe_all().await;
            }
        })
    }

    /// Probe every endpoint once (exposed for tests and readiness warmup).
    pub async fn probe_all(&self) {
        for endpoint in &self.endpoints {
            endpoint.probe().await;
        }
    }

    fn usable_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let healthy: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.state() == EndpointState::Healthy)
            .cloned()
            .collect();
        if !healthy.is_empty() {
            return healthy;
        }
        // Before the first probe completes (or while every endpoint is
        // between probe strikes) unknown and degraded endpoints still serve.
        self.endpoints
            .iter()
            .filter(|e| {
                matches!(
                    e.state(),
                    EndpointState::Unknown | EndpointState::Degraded
                )
            })
            .cloned()
            .collect()
    }

    async fn acquire(&self, model: &str) -> Result<(Arc<Endpoint>, OwnedSemaphorePermit)> {
        let mut ranked = self.usable_endpoints();
        if ranked.is_empty() {
            return Err(Error::NoBackend {
                model: model.to_string(),
            });
        }
        // Warm endpoints first, then fewest in-flight.
        ranked.sort_by_key(|e| (!e.is_warm(model), e.in_flight()));

        // Fast path: any endpoint with a free slot, in preference order.
        for endpoint in &ranked {
            if let Ok(permit) = Arc::clone(endpoint.semaphore()).try_acquire_owned() {
                return Ok((Arc::clone(endpoint), permit));
            }
        }

        // All busy: queue FIFO on the preferred endpoint up to the timeout.
        let preferred = Arc::clone(&ranked[0]);
        self.queued.fetch_add(1, Ordering::Relaxed);
        let waited = tokio::time::timeout(
            self.config.queue_timeout,
            Arc::clone(preferred.semaphore()).acquire_owned(),
        )
        .await;
        self.queued.fetch_sub(1, Ordering::Relaxed);

        match waited {
            Ok(Ok(permit)) => Ok((preferred, permit)),
            Ok(Err(_)) | Err(_) => Err(Error::NoBackend {
                model: model.to_string(),
            }),
        }
    }
}
