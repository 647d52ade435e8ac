//! End-to-end gateway scenarios against a scripted in-process backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use switchboard::backend::{ChunkStream, GenerateChunk, GenerateRequest, GenerateResponse};
use switchboard::cache::TieredCache;
use switchboard::config::GatewayConfig;
use switchboard::error::{Error, Result};
use switchboard::graph::NodeContext;
use switchboard::limits::{BudgetLedger, SlidingWindowLimiter};
use switchboard::metrics::GatewayMetrics;
use switchboard::pool::{BackendPool, Endpoint};
use switchboard::router::{AdaptiveRouter, RouteTable};
use switchboard::search::StaticSearchProvider;
use switchboard::session::SessionStore;
use switchboard::types::{
    Constraints, QualityLevel, Request, RequestPayload, ResearchDepth, RetrievedDocument,
    UserTier,
};
use switchboard::{BackendClient, Orchestrator};

const PRIMARY: &str = "primary-model";
const SECONDARY: &str = "secondary-model";

#[derive(Clone)]
enum Behavior {
    Reply(String),
    /// Sleeps far past every timeout.
    Hang,
}

struct ScriptedBackend {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
    stream_chunk_delay: Duration,
    generate_delay: Mutex<Duration>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            stream_chunk_delay: Duration::from_millis(20),
            generate_delay: Mutex::new(Duration::from_millis(5)),
        }
    }

    fn script(&self, model: &str, behavior: Behavior) {
        self.behaviors.lock().insert(model.to_string(), behavior);
    }

    fn set_generate_delay(&self, delay: Duration) {
        *self.generate_delay.lock() = delay;
    }

    fn behavior(&self, model: &str) -> Behavior {
        self.behaviors
            .lock()
            .get(model)
            .cloned()
            .unwrap_or_else(|| Behavior::Reply(format!("answer from {model}")))
    }

    fn calls_for(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|m| m.as_str() == model).count()
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.calls.lock().push(request.model.clone());
        let delay = *self.generate_delay.lock();
        match self.behavior(&request.model) {
            Behavior::Reply(text) => {
                tokio::time::sleep(delay).await;
                Ok(GenerateResponse {
                    response: text,
                    prompt_tokens: 50,
                    completion_tokens: 100,
                })
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Backend("unreachable".into()))
            }
        }
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<ChunkStream> {
        self.calls.lock().push(request.model.clone());
        let behavior = self.behavior(&request.model);
        let delay = self.stream_chunk_delay;
        let stream = async_stream::stream! {
            match behavior {
                Behavior::Reply(text) => {
                    for word in text.split_inclusive(' ') {
                        tokio::time::sleep(delay).await;
                        yield Ok(GenerateChunk {
                            delta: word.to_string(),
                            done: false,
                            completion_tokens: 0,
                        });
                    }
                    yield Ok(GenerateChunk {
                        delta: String::new(),
                        done: true,
                        completion_tokens: 40,
                    });
                }
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    yield Err(Error::Backend("unreachable".into()));
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![PRIMARY.to_string(), SECONDARY.to_string()])
    }

    async fn load_model(&self, _model: &str) -> Result<()> {
        Ok(())
    }

    fn endpoint_url(&self) -> &str {
        "http://scripted:11434"
    }
}

async fn gateway() -> (Arc<Orchestrator>, Arc<ScriptedBackend>) {
    let mut config = GatewayConfig::default();
    config.default_model = PRIMARY.to_string();
    config.fallback_model = SECONDARY.to_string();
    config.stream_chunk_min_ms = 0;
    let config = Arc::new(config);

    let backend = Arc::new(ScriptedBackend::new());
    let endpoint = Arc::new(Endpoint::new(
        Arc::clone(&backend) as Arc<dyn BackendClient>,
        None,
        &config.pool,
    ));
    let pool = Arc::new(BackendPool::new(vec![endpoint], config.pool.clone()));
    pool.probe_all().await;

    let router = Arc::new(AdaptiveRouter::new(
        RouteTable::defaults(PRIMARY, SECONDARY),
        config.router.clone(),
    ));
    let documents = vec![RetrievedDocument {
        title: "Result".into(),
        url: "https://example.com/one".into(),
        snippet: "relevant text".into(),
        score: 0.9,
    }];
    let ctx = Arc::new(NodeContext {
        cache: Arc::new(TieredCache::l1_only(&config.cache)),
        router,
        pool,
        providers: vec![Arc::new(StaticSearchProvider::new("static", documents))],
        sessions: Arc::new(SessionStore::default()),
        metrics: Arc::new(GatewayMetrics::new().unwrap()),
        config: Arc::clone(&config),
    });

    let limiter = Arc::new(SlidingWindowLimiter::new(config.rate.clone()));
    let ledger = Arc::new(BudgetLedger::new(config.budget.clone()));
    (
        Arc::new(Orchestrator::new(ctx, limiter, ledger)),
        backend,
    )
}

fn chat_request(user: &str, message: &str) -> Request {
    let mut request = Request::new(
        user,
        UserTier::Free,
        RequestPayload::Chat {
            history: vec![],
            message: message.into(),
        },
    );
    request.session_id = Some("s1".into());
    request
}

// S1: identical chat requests hit the cache the second time.
#[tokio::test]
async fn test_s1_chat_cache_hit() {
    let (gateway, backend) = gateway().await;

    let first = gateway.handle(chat_request("u1", "hi")).await.unwrap();
    assert!(!first.summary.cache_hit);
    assert!(!first.summary.models_used.is_empty());
    assert_eq!(backend.calls_for(PRIMARY) + backend.calls_for(SECONDARY), 1);

    let started = Instant::now();
    let second = gateway.handle(chat_request("u1", "hi")).await.unwrap();
    assert!(second.summary.cache_hit);
    assert!(second.summary.models_used.is_empty());
    assert_eq!(second.answer, first.answer);
    assert!(started.elapsed() < Duration::from_millis(50));
    // No additional backend call happened.
    assert_eq!(backend.calls_for(PRIMARY) + backend.calls_for(SECONDARY), 1);
}

// S2: a free-tier user gets 20 requests per minute, then 429s.
#[tokio::test]
async fn test_s2_rate_limit() {
    let (gateway, _backend) = gateway().await;

    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..25 {
        match gateway.handle(chat_request("burst-user", "hello limiter")).await {
            Ok(_) => accepted += 1,
            Err(Error::RateLimited {
                retry_after_seconds,
            }) => {
                assert!(retry_after_seconds <= 60);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(accepted, 20);
    assert_eq!(rejected, 5);
}

// S3: one request may overshoot the cap; the next is rejected.
#[tokio::test]
async fn test_s3_budget_stop() {
    let (gateway, _backend) = gateway().await;
    let now = chrono::Utc::now();
    gateway.ledger().set_cap("spender", 1.0, now);

    // Bring committed spend to 0.98 under the cap.
    let reservation = gateway.ledger().reserve("spender", 0.98, now).unwrap();
    gateway.ledger().commit(reservation, 0.98, now);

    // Still strictly under the cap: admitted under tolerance.
    let response = gateway
        .handle(chat_request("spender", "one more question"))
        .await
        .unwrap();
    assert!(!response.answer.is_empty());

    // Push the ledger past the cap and verify the hard stop.
    let snapshot = gateway.ledger().snapshot("spender", now);
    let reservation = gateway
        .ledger()
        .reserve("spender", 0.0, now)
        .ok();
    if let Some(reservation) = reservation {
        gateway
            .ledger()
            .commit(reservation, (1.0 - snapshot.spend_units).max(0.0) + 0.03, now);
    }
    let err = gateway
        .handle(chat_request("spender", "and another"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BudgetExceeded { .. }));
}

// S4: the primary route times out; the secondary serves the answer and is
// tried exactly once.
#[tokio::test(start_paused = true)]
async fn test_s4_backend_timeout_fallback() {
    let (gateway, backend) = gateway().await;
    backend.script(PRIMARY, Behavior::Hang);

    let mut request = chat_request("u1", "please summarize the release notes for me today");
    request.constraints = Constraints {
        quality: Some(QualityLevel::Standard),
        ..Constraints::default()
    };

    let response = gateway.handle(request).await.unwrap();
    assert_eq!(response.summary.models_used, vec![SECONDARY.to_string()]);
    assert_eq!(backend.calls_for(PRIMARY), 1);
    assert_eq!(backend.calls_for(SECONDARY), 1);
    assert!(response.answer.contains(SECONDARY));
}

// S5: a never-satisfied critic stops at the iteration bound and the
// best-so-far answer comes back flagged degraded.
#[tokio::test]
async fn test_s5_research_critic_loop_bound() {
    let (gateway, backend) = gateway().await;
    backend.script(PRIMARY, Behavior::Reply("draft synthesis".into()));
    backend.script(
        SECONDARY,
        Behavior::Reply("VERDICT: insufficient, needs deeper sourcing".into()),
    );

    let mut request = Request::new(
        "researcher",
        UserTier::Pro,
        RequestPayload::Research {
            question: "why do arenas beat self-referential graphs".into(),
            depth: ResearchDepth::Deep,
        },
    );
    request.constraints = Constraints {
        quality: Some(QualityLevel::High),
        ..Constraints::default()
    };

    let response = gateway.handle(request).await.unwrap();
    assert!(response.summary.degraded);
    assert_eq!(response.answer, "draft synthesis");
    // Two synthesis passes and two critic passes, no more.
    assert_eq!(backend.calls_for(PRIMARY), 2);
    assert_eq!(backend.calls_for(SECONDARY), 2);
}

// S6: client disconnect mid-stream cancels the backend call, skips the
// bandit update, and writes no cache entry.
#[tokio::test]
async fn test_s6_stream_cancellation() {
    let (gateway, backend) = gateway().await;
    backend.script(
        PRIMARY,
        Behavior::Reply(
            "once upon a time a gateway cached every answer it ever produced and the \
             users were pleased because latency dropped and the backends rested easy"
                .into(),
        ),
    );

    let mut request = chat_request("u1", "stream me a long story about caches please");
    request.constraints = Constraints {
        quality: Some(QualityLevel::Standard),
        ..Constraints::default()
    };

    let (cancel_handle, mut stream) = gateway.handle_stream(request).unwrap();
    let mut seen = 0;
    while let Some(frame) = stream.next().await {
        assert!(!frame.done, "stream finished before cancellation");
        seen += 1;
        if seen == 3 {
            break;
        }
    }
    assert_eq!(seen, 3);
    drop(cancel_handle);
    drop(stream);

    // Give the cancelled task a moment to unwind.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pulls: u64 = gateway
        .context()
        .router
        .bandit()
        .snapshot()
        .iter()
        .map(|arm| arm.pulls)
        .sum();
    assert_eq!(pulls, 0, "bandit must not learn from cancelled requests");
    assert_eq!(
        gateway.context().cache.l1_len(),
        0,
        "cancelled requests must not write cache"
    );
}

// Streaming order: deltas arrive in producer order and the summary frame
// is last.
#[tokio::test]
async fn test_stream_order_and_final_summary() {
    let (gateway, backend) = gateway().await;
    backend.script(PRIMARY, Behavior::Reply("alpha beta gamma delta".into()));
    backend.script(SECONDARY, Behavior::Reply("alpha beta gamma delta".into()));

    let request = chat_request("u1", "recite the greek letters in order for me");
    let (_handle, mut stream) = gateway.handle_stream(request).unwrap();

    let mut text = String::new();
    let mut done_frames = 0;
    let mut frames = 0;
    while let Some(frame) = stream.next().await {
        frames += 1;
        if frame.done {
            done_frames += 1;
            assert!(frame.summary.is_some());
        } else {
            assert_eq!(done_frames, 0, "delta after the final frame");
            text.push_str(&frame.delta);
        }
    }
    assert_eq!(done_frames, 1);
    assert!(frames >= 2);
    assert_eq!(text.trim_end(), "alpha beta gamma delta");
}

// Search requests retrieve documents and cite them.
#[tokio::test]
async fn test_search_pipeline_returns_citations() {
    let (gateway, _backend) = gateway().await;
    let request = Request::new(
        "searcher",
        UserTier::Pro,
        RequestPayload::Search {
            query: "lru cache eviction".into(),
            filters: Default::default(),
            max_results: 5,
        },
    );
    let response = gateway.handle(request).await.unwrap();
    assert!(!response.citations.is_empty());
    assert!(!response.summary.models_used.is_empty());
}

// Successful requests reward the bandit; the chosen arm's posterior moves.
#[tokio::test]
async fn test_reward_commits_after_success() {
    let (gateway, _backend) = gateway().await;
    gateway
        .handle(chat_request("u1", "teach me something new"))
        .await
        .unwrap();
    let pulls: u64 = gateway
        .context()
        .router
        .bandit()
        .snapshot()
        .iter()
        .map(|arm| arm.pulls)
        .sum();
    assert_eq!(pulls, 1);
}

// Overload backpressure: a saturated pool queue rejects new work.
#[tokio::test]
async fn test_overloaded_rejection() {
    let (gateway, backend) = gateway().await;
    backend.script(PRIMARY, Behavior::Hang);
    backend.script(SECONDARY, Behavior::Hang);

    // Saturate the single-slot endpoint and its queue.
    let mut holders = Vec::new();
    for _ in 0..gateway.context().config.pool.queue_high_watermark + 1 {
        let pool = Arc::clone(&gateway.context().pool);
        holders.push(tokio::spawn(async move {
            let _ = pool
                .invoke(
                    &GenerateRequest::new(PRIMARY, "x"),
                    switchboard::TaskClass::Research,
                    &switchboard::CancelToken::never(),
                )
                .await;
        }));
    }
    // Wait for the queue to fill.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !gateway.context().pool.is_saturated() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gateway.context().pool.is_saturated());

    let err = gateway
        .handle(chat_request("u9", "is anyone there"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Overloaded));
    for holder in holders {
        holder.abort();
    }
}

// Single-flight at the gateway level: N concurrent identical misses
// collapse to exactly one backend producer, and every caller observes the
// same answer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_misses_single_producer() {
    let (gateway, backend) = gateway().await;
    backend.script(PRIMARY, Behavior::Reply("the shared answer".into()));
    backend.script(SECONDARY, Behavior::Reply("the shared answer".into()));
    // Slow the producer so every request overlaps the first one's flight.
    backend.set_generate_delay(Duration::from_millis(150));

    let mut handles = Vec::new();
    for i in 0..8 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway
                .handle(chat_request(&format!("flight-user-{i}"), "what is a fingerprint"))
                .await
        }));
    }
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }

    // Exactly one producer reached the backend.
    assert_eq!(
        backend.calls_for(PRIMARY) + backend.calls_for(SECONDARY),
        1,
        "concurrent identical misses must collapse to one producer"
    );
    for response in &responses {
        assert_eq!(response.answer, "the shared answer");
    }
    let producers = responses
        .iter()
        .filter(|r| !r.summary.models_used.is_empty())
        .count();
    assert_eq!(producers, 1, "only the leader invokes a model");
    // Everyone else was served from the flight or the freshly written cache.
    assert!(responses
        .iter()
        .filter(|r| r.summary.models_used.is_empty())
        .all(|r| r.summary.cache_hit));
}

// Concurrency safety: hammer cache and bandit from many tasks at once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cache_and_bandit_stress() {
    let (gateway, _backend) = gateway().await;
    let mut handles = Vec::new();
    for i in 0..32 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            let message = format!("question number {}", i % 8);
            gateway
                .handle(chat_request(&format!("user-{i}"), &message))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let config = &gateway.context().config.cache;
    assert!(gateway.context().cache.l1_len() <= config.l1_max_items);
    assert!(gateway.context().cache.l1_bytes() <= config.l1_max_bytes);
}

// The stream sink is how the executor emits: ensure a cache-hit stream
// still produces exactly one delta plus the summary frame.
#[tokio::test]
async fn test_stream_cache_hit_single_frame() {
    let (gateway, _backend) = gateway().await;
    // Prime the cache with a buffered request.
    gateway
        .handle(chat_request("u1", "what time is it"))
        .await
        .unwrap();

    let (_handle, stream) = gateway
        .handle_stream(chat_request("u1", "what time is it"))
        .unwrap();
    let frames: Vec<_> = stream.collect().await;
    assert_eq!(frames.len(), 2);
    assert!(!frames[0].done);
    assert!(frames[1].done);
    let summary = frames[1].summary.as_ref().unwrap();
    assert!(summary.cache_hit);
    assert!(summary.models_used.is_empty());
}
