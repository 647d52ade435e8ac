//! Built-in node implementations.
//!
//! Each node is a plain async function over `(&NodeContext, &mut GraphState,
//! &CancelToken)`; the executor dispatches on the descriptor's kind tag.
//! Components arrive through [`NodeContext`], constructed once at startup;
//! there are no module-level singletons.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

use crate::backend::GenerateRequest;
use crate::cache::{ttl_for, CacheEntry, TieredCache};
use crate::cancel::CancelToken;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::fingerprint::fingerprint_request;
use crate::graph::state::{GraphState, MAX_CRITIC_ITERATIONS};
use crate::graph::stream::ChunkPacer;
use crate::metrics::GatewayMetrics;
use crate::pool::{BackendPool, TaskClass};
use crate::router::{classify_complexity, AdaptiveRouter, Route};
use crate::search::{SearchProvider, SearchQuery};
use crate::session::SessionStore;
use crate::types::{RequestPayload, ResearchDepth, RetrievedDocument, Role};

/// Concurrent provider fetches during Retrieve.
const RETRIEVE_PARALLELISM: usize = 4;

/// Per-provider timeout during Retrieve.
const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed safe answer when every recovery path is exhausted.
pub const SAFE_FALLBACK_ANSWER: &str =
    "I wasn't able to fully process that request just now. Please try again in a moment, \
     or rephrase the question.";

/// Components every node receives, constructed once at startup.
pub struct NodeContext {
    /// Two-tier response cache.
    pub cache: Arc<TieredCache>,
    /// Adaptive router.
    pub router: Arc<AdaptiveRouter>,
    /// Backend pool.
    pub pool: Arc<BackendPool>,
    /// Search providers for Retrieve fan-out.
    pub providers: Vec<Arc<dyn SearchProvider>>,
    /// Best-effort session history.
    pub sessions: Arc<SessionStore>,
    /// Gateway metrics.
    pub metrics: Arc<GatewayMetrics>,
    /// Gateway configuration.
    pub config: Arc<GatewayConfig>,
}

/// The payload cached for a finished request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAnswer {
    /// Final answer text.
    pub answer: String,
    /// Citations that accompanied it.
    #[serde(default)]
    pub citations: Vec<RetrievedDocument>,
}

/// Plan: classify the query and fingerprint the request.
pub async fn run_plan(
    _ctx: &NodeContext,
    state: &mut GraphState,
    _cancel: &CancelToken,
) -> Result<()> {
    state.complexity = classify_complexity(state.request.query_text());
    state.fingerprint = Some(fingerprint_request(
        &state.request,
        state.task().as_str(),
    ));
    Ok(())
}

/// CacheLookup: short-circuit to Emit on a hit.
///
/// On a miss the node joins the single-flight for the fingerprint: a
/// follower waits for the in-flight producer's answer (and emits it like a
/// hit), while the leader keeps the guard in state and continues down the
/// miss path. Exactly one producer per key reaches the backend.
pub async fn run_cache_lookup(
    ctx: &NodeContext,
    state: &mut GraphState,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    let Some(fingerprint) = state.fingerprint.clone() else {
        return Ok(());
    };
    if let Some((entry, level)) = ctx.cache.get_labeled(&fingerprint).await {
        if apply_cached(ctx, state, &entry, level) {
            return Ok(());
        }
    }

    match ctx.cache.join_flight(&fingerprint) {
        crate::cache::Flight::Follower(rx) => {
            state.timeline.record(EventKind::CacheMiss);
            let produced = tokio::select! {
                () = cancel.cancelled() => Err(Error::Cancelled),
                result = rx => result.unwrap_or(Err(Error::Cancelled)),
            };
            let entry = match produced {
                Ok(entry) => entry,
                Err(Error::Cancelled) if !cancel.is_cancelled() => {
                    // The producer was cancelled without completing; take
                    // over the miss path ourselves.
                    if let crate::cache::Flight::Leader(guard) =
                        ctx.cache.join_flight(&fingerprint)
                    {
                        state.flight = Some(guard);
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            cancel.check()?;
            if !apply_cached(ctx, state, &entry, "single_flight") {
                return Err(Error::CacheDegraded(
                    "single-flight producer delivered an unreadable entry".into(),
                ));
            }
            Ok(())
        }
        crate::cache::Flight::Leader(guard) => {
            // A previous leader may have completed between our miss and
            // taking the flight.
            if let Some((entry, level)) = ctx.cache.get_labeled(&fingerprint).await {
                if apply_cached(ctx, state, &entry, level) {
                    guard.complete(&Ok(entry));
                    return Ok(());
                }
            }
            state.timeline.record(EventKind::CacheMiss);
            ctx.metrics
                .cache_misses_total
                .with_label_values(&[state.task().as_str()])
                .inc();
            state.flight = Some(guard);
            Ok(())
        }
    }
}

/// Load a cached entry into the state as a hit. Returns false when the
/// payload is unreadable (treated as a miss by the caller).
fn apply_cached(
    ctx: &NodeContext,
    state: &mut GraphState,
    entry: &CacheEntry,
    level: &str,
) -> bool {
    let cached: CachedAnswer = match entry.json() {
        Ok(cached) => cached,
        Err(e) => {
            tracing::warn!(error = %e, "cached answer unreadable, treating as miss");
            return false;
        }
    };
    state.answer = Some(cached.answer);
    state.documents = cached.citations;
    state.cache_hit = true;
    state.cache_hits += 1;
    state.timeline.record(EventKind::CacheHit {
        level: level.to_string(),
    });
    ctx.metrics.cache_hits_total.with_label_values(&[level]).inc();
    true
}

/// Route: pick a model route via the adaptive router.
pub async fn run_route(
    ctx: &NodeContext,
    state: &mut GraphState,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    let decision = ctx.router.select(
        state.task(),
        state.request.query_text(),
        &state.request.constraints,
    )?;
    state.timeline.record(EventKind::RouteChosen {
        route: decision.route.name.clone(),
        bucket: decision.bucket.to_string(),
        explored: decision.explored,
    });
    state.decision = Some(decision);
    Ok(())
}

/// Retrieve: fan out to search providers with bounded parallelism and a
/// per-provider timeout. Provider failures degrade to partial results.
pub async fn run_retrieve(
    ctx: &NodeContext,
    state: &mut GraphState,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    if ctx.providers.is_empty() {
        return Ok(());
    }

    let (query_text, max_results) = match &state.request.payload {
        RequestPayload::Search {
            query, max_results, ..
        } => (query.clone(), *max_results),
        RequestPayload::Research { question, depth } => {
            let wanted = match depth {
                ResearchDepth::Shallow => 5,
                ResearchDepth::Standard => 8,
                ResearchDepth::Deep => 12,
            };
            (question.clone(), wanted)
        }
        RequestPayload::Chat { .. } => return Ok(()),
    };
    let filters = match &state.request.payload {
        RequestPayload::Search { filters, .. } => filters.clone(),
        _ => Default::default(),
    };
    let query = Arc::new(SearchQuery {
        query: query_text,
        filters,
        max_results,
    });

    let timeout = RETRIEVE_TIMEOUT.min(state.remaining().max(Duration::from_millis(100)));
    let mut provider_futures: Vec<
        std::pin::Pin<Box<dyn std::future::Future<Output = (String, std::result::Result<Result<Vec<RetrievedDocument>>, tokio::time::error::Elapsed>)> + Send>>,
    > = Vec::new();
    for provider in ctx.providers.iter().cloned() {
        provider_futures.push(Box::pin(fetch_from_provider(provider, Arc::clone(&query), timeout)));
    }
    let mut fetches = futures::stream::iter(provider_futures).buffer_unordered(RETRIEVE_PARALLELISM);

    let mut documents: Vec<RetrievedDocument> = Vec::new();
    while let Some((provider, result)) = fetches.next().await {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match result {
            Ok(Ok(mut docs)) => documents.append(&mut docs),
            Ok(Err(e)) => {
                tracing::warn!(provider, error = %e, "search provider failed");
            }
            Err(_) => {
                tracing::warn!(provider, timeout_ms = timeout.as_millis() as u64, "search provider timed out");
            }
        }
    }

    // Dedupe by URL, best score first, bounded by the request's ask.
    documents.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen = std::collections::HashSet::new();
    documents.retain(|doc| seen.insert(doc.url.clone()));
    documents.truncate(max_results);
    state.documents = documents;
    Ok(())
}

async fn fetch_from_provider(
    provider: Arc<dyn SearchProvider>,
    query: Arc<SearchQuery>,
    timeout: Duration,
) -> (String, std::result::Result<Result<Vec<RetrievedDocument>>, tokio::time::error::Elapsed>) {
    let name = provider.name().to_string();
    let result = tokio::time::timeout(timeout, provider.search(&query)).await;
    (name, result)
}

/// Synthesize: call the backend over the chosen route, advancing the
/// fallback chain at most once per failed route.
pub async fn run_synthesize(
    ctx: &NodeContext,
    state: &mut GraphState,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    let decision = state.decision.clone().ok_or_else(|| Error::Graph {
        node: "synthesize".to_string(),
        detail: "route decision missing".to_string(),
    })?;
    let class = TaskClass::for_request(state.task(), state.complexity);
    let prompt = build_prompt(ctx, state);

    let mut route = decision.route.clone();
    if !state.routes_tried.contains(&route.name) {
        state.routes_tried.push(route.name.clone());
    }

    loop {
        cancel.check()?;
        if let Err(e) = ctx.pool.warm_up(&route.model).await {
            tracing::debug!(model = %route.model, error = %e, "warm-up skipped");
        }
        let request = GenerateRequest::new(&route.model, &prompt);
        let attempt = if state.chunk_tx.is_some() {
            synthesize_streaming(ctx, state, &route, &request, cancel).await
        } else {
            synthesize_buffered(ctx, state, &route, &request, class, cancel).await
        };

        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if e.triggers_fallback() => {
                ctx.metrics
                    .backend_errors_total
                    .with_label_values(&[e.kind()])
                    .inc();
                let next = ctx
                    .router
                    .table()
                    .next_fallback(&route, &state.routes_tried)
                    .cloned();
                match next {
                    Some(fallback) => {
                        tracing::warn!(
                            from = %route.name,
                            to = %fallback.name,
                            error = %e,
                            "advancing fallback chain"
                        );
                        state.timeline.record(EventKind::FallbackUsed {
                            from: route.name.clone(),
                            to: fallback.name.clone(),
                        });
                        ctx.metrics
                            .fallbacks_total
                            .with_label_values(&[route.name.as_str()])
                            .inc();
                        state.routes_tried.push(fallback.name.clone());
                        route = fallback;
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn synthesize_buffered(
    ctx: &NodeContext,
    state: &mut GraphState,
    route: &Route,
    request: &GenerateRequest,
    class: TaskClass,
    cancel: &CancelToken,
) -> Result<()> {
    let reply = ctx.pool.invoke(request, class, cancel).await?;
    state.timeline.record(EventKind::BackendCall {
        endpoint: reply.endpoint_url.clone(),
        model: route.model.clone(),
    });
    ctx.metrics
        .backend_latency_seconds
        .with_label_values(&[route.model.as_str()])
        .observe(reply.latency.as_secs_f64());
    ctx.metrics
        .tokens_total
        .with_label_values(&["prompt"])
        .inc_by(reply.response.prompt_tokens);
    ctx.metrics
        .tokens_total
        .with_label_values(&["completion"])
        .inc_by(reply.response.completion_tokens);

    let tokens = reply.response.total_tokens();
    state.tokens_used += tokens;
    state.cost_accumulated += route.estimate_cost(tokens);
    state.models_used.push(route.model.clone());
    state.draft = Some(reply.response.response.clone());
    state.answer = Some(reply.response.response);
    Ok(())
}

async fn synthesize_streaming(
    ctx: &NodeContext,
    state: &mut GraphState,
    route: &Route,
    request: &GenerateRequest,
    cancel: &CancelToken,
) -> Result<()> {
    let Some(tx) = state.chunk_tx.clone() else {
        return Err(Error::Internal("streaming synthesize without a sink".into()));
    };
    let mut stream = ctx.pool.invoke_stream(request, cancel).await?;
    state.timeline.record(EventKind::BackendCall {
        endpoint: stream.endpoint_url.clone(),
        model: route.model.clone(),
    });
    let mut pacer = ChunkPacer::new(tx, Duration::from_millis(ctx.config.stream_chunk_min_ms));
    let mut full = String::new();
    let mut completion_tokens = 0;

    while let Some(chunk) = stream.chunks.next().await {
        let chunk = chunk?;
        if !chunk.delta.is_empty() {
            full.push_str(&chunk.delta);
            pacer.push(&chunk.delta).await?;
        }
        if chunk.done {
            completion_tokens = chunk.completion_tokens;
            break;
        }
    }
    pacer.finish().await?;

    // Prompt tokens are not reported on the stream path; estimate the
    // prompt side from the prompt actually sent. Completion tokens come
    // from the terminal chunk.
    let prompt_tokens = crate::router::predict_prompt_tokens(&request.prompt);
    let tokens = prompt_tokens + completion_tokens;
    state.tokens_used += tokens;
    state.cost_accumulated += route.estimate_cost(tokens);
    state.models_used.push(route.model.clone());
    state.draft = Some(full.clone());
    state.answer = Some(full);
    state.streamed = true;
    Ok(())
}

/// Critic: judge the draft with the critic route; loops back to Synthesize
/// through the graph's bounded conditional edge while unsatisfied.
pub async fn run_critic(
    ctx: &NodeContext,
    state: &mut GraphState,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    let draft = state.draft.clone().unwrap_or_default();
    let critic_route = ctx
        .router
        .table()
        .get("research-critic")
        .cloned()
        .or_else(|| state.decision.as_ref().map(|d| d.route.clone()))
        .ok_or_else(|| Error::Graph {
            node: "critic".to_string(),
            detail: "no critic route available".to_string(),
        })?;

    let prompt = format!(
        "You are a strict research reviewer. Evaluate whether the draft below fully \
         answers the question.\n\nQuestion: {}\n\nDraft:\n{}\n\nReply with exactly \
         'VERDICT: sufficient' or 'VERDICT: insufficient', followed by one line of \
         guidance.",
        state.request.query_text(),
        draft
    );
    let request = GenerateRequest::new(&critic_route.model, prompt);
    let reply = ctx
        .pool
        .invoke(&request, TaskClass::Standard, cancel)
        .await?;

    let verdict = reply.response.response.to_lowercase();
    state.critic_satisfied = !verdict.contains("insufficient");
    state.critic_feedback = Some(reply.response.response.clone());
    state.iterations += 1;

    let tokens = reply.response.total_tokens();
    state.tokens_used += tokens;
    state.cost_accumulated += critic_route.estimate_cost(tokens);
    state.models_used.push(critic_route.model.clone());

    if !state.critic_satisfied && state.iterations >= MAX_CRITIC_ITERATIONS {
        // Loop bound reached: serve best-so-far, flagged degraded.
        state.degraded = true;
        state.timeline.record(EventKind::Degraded {
            reason: "critic unsatisfied at iteration bound".to_string(),
        });
    }
    Ok(())
}

/// CacheStore: persist a successful answer under the request fingerprint
/// and complete the single-flight so waiting followers receive it.
/// Degraded or errored executions are never cached, but a degraded answer
/// is still handed to followers; cancelled executions complete nothing
/// (the guard's drop releases waiters).
pub async fn run_cache_store(
    ctx: &NodeContext,
    state: &mut GraphState,
    cancel: &CancelToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if state.cache_hit {
        return Ok(());
    }
    let (Some(fingerprint), Some(answer)) = (state.fingerprint.clone(), state.answer.clone())
    else {
        if let Some(guard) = state.flight.take() {
            guard.complete(&Err(Error::Internal("producer finished without an answer".into())));
        }
        return Ok(());
    };
    let ttl = ttl_for(state.task(), state.complexity);
    let entry = CacheEntry::from_json(
        &CachedAnswer {
            answer,
            citations: state.documents.clone(),
        },
        ttl,
        "synthesize",
    )?;
    if state.degraded || state.error.is_some() {
        if let Some(guard) = state.flight.take() {
            guard.complete(&Ok(entry));
        }
        return Ok(());
    }
    ctx.cache.put(&fingerprint, entry.clone()).await;
    if let Some(guard) = state.flight.take() {
        guard.complete(&Ok(entry));
    }
    Ok(())
}

/// Emit: finalize the response. For streaming requests that were answered
/// without a producer stream (cache hit, recovery), the whole answer goes
/// out as a single delta frame.
pub async fn run_emit(
    ctx: &NodeContext,
    state: &mut GraphState,
    _cancel: &CancelToken,
) -> Result<()> {
    let answer = state.answer.clone().ok_or_else(|| Error::Graph {
        node: "emit".to_string(),
        detail: "no answer to emit".to_string(),
    })?;
    if let Some(tx) = state.chunk_tx.clone() {
        if !state.streamed && !answer.is_empty() {
            tx.send(crate::types::StreamFrame::delta(answer))
                .await
                .map_err(|_| Error::Cancelled)?;
        }
    }
    // Remember the exchange for the session, best effort.
    if let (Some(session_id), RequestPayload::Chat { message, .. }) =
        (&state.request.session_id, &state.request.payload)
    {
        if let Some(answer) = &state.answer {
            ctx.sessions.append(
                session_id,
                crate::types::ChatMessage::user(message.clone()),
                crate::types::ChatMessage::assistant(answer.clone()),
            );
        }
    }
    Ok(())
}

/// ErrorRecovery: convert a failure into a graceful degraded answer. Raw
/// error detail stays in the logs, never in the client answer.
pub async fn run_error_recovery(
    _ctx: &NodeContext,
    state: &mut GraphState,
    _cancel: &CancelToken,
) -> Result<()> {
    // Hand the leader's failure to single-flight followers; each runs its
    // own recovery and produces the same safe answer.
    if let Some(guard) = state.flight.take() {
        let failure = state
            .error
            .clone()
            .unwrap_or_else(|| Error::Internal("producer failed".into()));
        guard.complete(&Err(failure));
    }
    let reason = state
        .error
        .as_ref()
        .map(|e| e.kind().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::warn!(
        correlation_id = %state.request.id,
        reason,
        "recovering request with degraded answer"
    );
    state.degraded = true;
    if state.answer.is_none() {
        state.answer = Some(match &state.draft {
            Some(draft) if !draft.is_empty() => draft.clone(),
            _ => SAFE_FALLBACK_ANSWER.to_string(),
        });
    }
    state.timeline.record(EventKind::Degraded { reason });
    Ok(())
}

/// Build the synthesis prompt for the request.
fn build_prompt(ctx: &NodeContext, state: &GraphState) -> String {
    match &state.request.payload {
        RequestPayload::Chat { history, message } => {
            let mut prompt = String::from("You are a helpful assistant.\n\n");
            let turns: Vec<crate::types::ChatMessage> = if history.is_empty() {
                state
                    .request
                    .session_id
                    .as_deref()
                    .map(|sid| ctx.sessions.recent(sid))
                    .unwrap_or_default()
            } else {
                history.clone()
            };
            for turn in turns {
                let role = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                    Role::System => "System",
                };
                prompt.push_str(&format!("{role}: {}\n", turn.content));
            }
            prompt.push_str(&format!("User: {message}\nAssistant:"));
            prompt
        }
        RequestPayload::Search { query, .. } => {
            let mut prompt = String::from(
                "Answer the query using only the sources below. Cite sources by number.\n\n",
            );
            for (idx, doc) in state.documents.iter().enumerate() {
                prompt.push_str(&format!(
                    "[{}] {} ({})\n{}\n\n",
                    idx + 1,
                    doc.title,
                    doc.url,
                    doc.snippet
                ));
            }
            prompt.push_str(&format!("Query: {query}\nAnswer:"));
            prompt
        }
        RequestPayload::Research { question, .. } => {
            let mut prompt = String::from(
                "Write a structured, citation-backed synthesis answering the research \
                 question. Cite sources by number.\n\n",
            );
            for (idx, doc) in state.documents.iter().enumerate() {
                prompt.push_str(&format!(
                    "[{}] {} ({})\n{}\n\n",
                    idx + 1,
                    doc.title,
                    doc.url,
                    doc.snippet
                ));
            }
            if let (Some(draft), Some(feedback)) = (&state.draft, &state.critic_feedback) {
                prompt.push_str(&format!(
                    "Previous draft:\n{draft}\n\nReviewer guidance:\n{feedback}\n\n"
                ));
            }
            prompt.push_str(&format!("Research question: {question}\nSynthesis:"));
            prompt
        }
    }
}
