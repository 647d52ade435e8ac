// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The orchestrator: admission, graph selection, execution, and learning.
//!
//! Per request: rate limit → backpressure → budget reservation → graph
//! execution → bandit reward commit → budget commit → response assembly.
//! Cancelled requests release their reservation and never update the
//! bandit. The chat path carries a last-resort fallback (one minimal-model
//! call with a fixed safe prompt, then a static helpful message) so chat
//! callers always receive an answer rather than an error.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::backend::GenerateRequest;
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::graph::{
    chat_graph, research_graph, search_graph, CompiledGraph, Executor, GraphState, NodeContext,
    SAFE_FALLBACK_ANSWER,
};
use crate::limits::{BudgetLedger, Reservation, SlidingWindowLimiter};
use crate::pool::TaskClass;
use crate::router::{classify_complexity, predict_tokens, RouteOutcome};
use crate::types::{
    GatewayResponse, Request, StreamFrame, TaskType,
};

/// Hard execution deadlines by task type, used when the request carries no
/// latency constraint.
fn default_deadline(task: TaskType) -> Duration {
    match task {
        TaskType::Chat | TaskType::Search => Duration::from_secs(120),
        TaskType::Research => Duration::from_secs(300),
    }
}

#[derive(Default)]
struct Graphs {
    chat: OnceLock<CompiledGraph>,
    search: OnceLock<CompiledGraph>,
    research: OnceLock<CompiledGraph>,
}

/// Receives requests, runs them through their graph, and returns the
/// response or stream.
pub struct Orchestrator {
    ctx: Arc<NodeContext>,
    executor: Executor,
    limiter: Arc<SlidingWindowLimiter>,
    ledger: Arc<BudgetLedger>,
    graphs: Graphs,
}

impl Orchestrator {
    /// Assemble the orchestrator from its components.
    #[must_use]
    pub fn new(
        ctx: Arc<NodeContext>,
        limiter: Arc<SlidingWindowLimiter>,
        ledger: Arc<BudgetLedger>,
    ) -> Self {
        let executor = Executor::new(Arc::clone(&ctx));
        Self {
            ctx,
            executor,
            limiter,
            ledger,
            graphs: Graphs::default(),
        }
    }

    /// The shared component context.
    #[must_use]
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// The budget ledger (exposed for admin surfaces and tests).
    #[must_use]
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Whether the gateway can serve traffic: at least one healthy backend
    /// (L1 cache is in-process and always operational; L2 does not gate
    /// readiness).
    #[must_use]
    pub fn ready(&self) -> bool {
        let healthy = self.ctx.pool.healthy_count();
        self.ctx.metrics.healthy_endpoints.set(healthy as i64);
        healthy >= 1
    }

    /// Serve a buffered request.
    ///
    /// # Errors
    ///
    /// Admission errors (`RATE_LIMITED`, `BUDGET_EXCEEDED`, `OVERLOADED`,
    /// `VALIDATION_ERROR`) surface directly. Execution errors surface for
    /// search/research; chat falls back to a degraded answer instead.
    pub async fn handle(&self, request: Request) -> Result<GatewayResponse> {
        let reservation = self.admit(&request)?;
        let task = request.task_type();
        let correlation_id = request.id;
        let graph = self.graph_for(task)?;
        let deadline = request
            .constraints
            .max_latency_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_deadline(task));

        let state = GraphState::new(request, deadline);
        state.timeline.record(EventKind::Accepted);
        let (_cancel_handle, cancel) = cancel_pair();

        match self.executor.invoke(&graph, state, &cancel).await {
            Ok(state) => Ok(self.complete(state, reservation)),
            Err(Error::Cancelled) => {
                self.ledger.release(reservation, Utc::now());
                Err(Error::Cancelled)
            }
            Err(e @ Error::Validation(_)) => {
                self.ledger.release(reservation, Utc::now());
                Err(e)
            }
            Err(e) if task == TaskType::Chat => {
                // Last-resort chat fallback; the reservation is still
                // committed with whatever the rescue call cost.
                tracing::warn!(error = %e, "chat pipeline failed, using last-resort fallback");
                let (answer, cost, model) = self.last_resort_chat().await;
                self.ledger.commit(reservation, cost, Utc::now());
                self.ctx
                    .metrics
                    .requests_total
                    .with_label_values(&[task.as_str(), "degraded"])
                    .inc();
                Ok(GatewayResponse {
                    answer,
                    citations: Vec::new(),
                    summary: crate::types::ResponseSummary {
                        correlation_id,
                        models_used: model.into_iter().collect(),
                        cost,
                        tokens_used: 0,
                        cache_hit: false,
                        latency_ms: 0,
                        degraded: true,
                    },
                })
            }
            Err(e) => {
                self.ledger.release(reservation, Utc::now());
                self.ctx
                    .metrics
                    .requests_total
                    .with_label_values(&[task.as_str(), e.kind()])
                    .inc();
                Err(e)
            }
        }
    }

    /// Serve a streaming request. Returns the cancel handle (drop it to
    /// cancel on client disconnect) and the frame stream; the final frame
    /// carries the summary and is always last.
    ///
    /// # Errors
    ///
    /// Admission errors surface before any frame is produced.
    pub fn handle_stream(
        self: &Arc<Self>,
        mut request: Request,
    ) -> Result<(CancelHandle, ReceiverStream<StreamFrame>)> {
        request.stream = true;
        let reservation = self.admit(&request)?;
        let task = request.task_type();
        let correlation_id = request.id;
        let graph = self.graph_for(task)?;
        let deadline = request
            .constraints
            .max_latency_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_deadline(task));

        let (tx, rx) = mpsc::channel::<StreamFrame>(32);
        let (cancel_handle, cancel) = cancel_pair();
        let mut state = GraphState::new(request, deadline);
        state.timeline.record(EventKind::Accepted);
        state.chunk_tx = Some(tx.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            match orchestrator.executor.invoke(&graph, state, &cancel).await {
                Ok(state) => {
                    let response = orchestrator.complete(state, reservation);
                    let _ = tx.send(StreamFrame::done(response.summary)).await;
                }
                Err(Error::Cancelled) => {
                    orchestrator.ledger.release(reservation, Utc::now());
                    tracing::debug!("stream cancelled by client");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stream pipeline failed");
                    orchestrator.ledger.release(reservation, Utc::now());
                    let summary = crate::types::ResponseSummary {
                        correlation_id,
                        models_used: Vec::new(),
                        cost: 0.0,
                        tokens_used: 0,
                        cache_hit: false,
                        latency_ms: 0,
                        degraded: true,
                    };
                    if tx
                        .send(StreamFrame::delta(SAFE_FALLBACK_ANSWER))
                        .await
                        .is_ok()
                    {
                        let _ = tx.send(StreamFrame::done(summary)).await;
                    }
                }
            }
        });

        Ok((cancel_handle, ReceiverStream::new(rx)))
    }

    /// Run a request that bypasses admission (tests, internal calls).
    ///
    /// # Errors
    ///
    /// Propagates execution errors without the chat rescue path.
    pub async fn execute_unmetered(
        &self,
        request: Request,
        cancel: &CancelToken,
    ) -> Result<GraphState> {
        let task = request.task_type();
        let graph = self.graph_for(task)?;
        let deadline = request
            .constraints
            .max_latency_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_deadline(task));
        let state = GraphState::new(request, deadline);
        self.executor.invoke(&graph, state, cancel).await
    }

    fn admit(&self, request: &Request) -> Result<Reservation> {
        validate(request)?;

        if let Err(e) = self.limiter.check(
            &request.user_id,
            request.tier,
            std::time::Instant::now(),
        ) {
            self.ctx
                .metrics
                .rate_limited_total
                .with_label_values(&[request.tier.as_str()])
                .inc();
            return Err(e);
        }

        if self.ctx.pool.is_saturated() {
            self.ctx
                .metrics
                .requests_total
                .with_label_values(&[request.task_type().as_str(), "overloaded"])
                .inc();
            return Err(Error::Overloaded);
        }

        let estimate = self.estimate_cost(request);
        match self.ledger.reserve(&request.user_id, estimate, Utc::now()) {
            Ok(reservation) => Ok(reservation),
            Err(e) => {
                self.ctx
                    .metrics
                    .budget_rejected_total
                    .with_label_values(&[request.tier.as_str()])
                    .inc();
                Err(e)
            }
        }
    }

    fn estimate_cost(&self, request: &Request) -> f64 {
        let complexity = classify_complexity(request.query_text());
        let tokens = predict_tokens(request.query_text(), complexity);
        let task = request.task_type();
        self.ctx
            .router
            .table()
            .routes()
            .iter()
            .filter(|r| r.task == task)
            .map(|r| r.estimate_cost(tokens))
            .fold(0.0, f64::max)
    }

    /// Commit learning and accounting for a finished execution and build
    /// the response.
    fn complete(&self, state: GraphState, reservation: Reservation) -> GatewayResponse {
        let summary = state.summary();
        let task = state.task();

        // Reward the chosen arm. Cache hits short-circuit before routing
        // and therefore carry no decision to reward.
        if let Some(decision) = &state.decision {
            let ceiling = state.request.constraints.max_cost.unwrap_or_else(|| {
                (decision.route.estimate_cost(decision.predicted_tokens) * 2.0).max(1e-6)
            });
            let outcome = RouteOutcome {
                success: !state.degraded && state.answer.is_some(),
                latency_ms: summary.latency_ms,
                target_latency_ms: self.ctx.config.target_response_time_ms,
                cost: state.cost_accumulated,
                cost_ceiling: ceiling,
                user_feedback: None,
            };
            let reward = self.ctx.router.reward(&outcome);
            self.ctx.metrics.bandit_reward.observe(reward);
            self.ctx.router.commit(decision, &outcome);
        }

        self.ledger
            .commit(reservation, state.cost_accumulated, Utc::now());

        let outcome_label = if summary.degraded { "degraded" } else { "ok" };
        self.ctx
            .metrics
            .requests_total
            .with_label_values(&[task.as_str(), outcome_label])
            .inc();
        self.ctx
            .metrics
            .request_latency_seconds
            .with_label_values(&[task.as_str()])
            .observe(summary.latency_ms as f64 / 1000.0);
        state.timeline.record(EventKind::Completed {
            latency_ms: summary.latency_ms,
            cache_hit: summary.cache_hit,
        });

        GatewayResponse {
            answer: state.answer.unwrap_or_default(),
            citations: state.documents,
            summary,
        }
    }

    /// One minimal-model call with a fixed safe prompt, then the static
    /// message.
    async fn last_resort_chat(&self) -> (String, f64, Option<String>) {
        let model = self.ctx.config.fallback_model.clone();
        let request = GenerateRequest::new(
            &model,
            "Reply with one short, friendly sentence telling the user you are having \
             temporary trouble and they should retry shortly.",
        );
        match self
            .ctx
            .pool
            .invoke(&request, TaskClass::Simple, &CancelToken::never())
            .await
        {
            Ok(reply) => {
                let cost = (reply.response.total_tokens() as f64 / 1000.0) * 0.001;
                (reply.response.response, cost, Some(model))
            }
            Err(e) => {
                tracing::warn!(error = %e, "last-resort model call failed, using static answer");
                (SAFE_FALLBACK_ANSWER.to_string(), 0.0, None)
            }
        }
    }

    fn graph_for(&self, task: TaskType) -> Result<CompiledGraph> {
        let (cell, build): (&OnceLock<CompiledGraph>, fn() -> Result<CompiledGraph>) = match task
        {
            TaskType::Chat => (&self.graphs.chat, chat_graph),
            TaskType::Search => (&self.graphs.search, search_graph),
            TaskType::Research => (&self.graphs.research, research_graph),
        };
        if let Some(graph) = cell.get() {
            return Ok(graph.clone());
        }
        let graph = build()?;
        Ok(cell.get_or_init(|| graph).clone())
    }
}

/// Request validation at the orchestration boundary.
fn validate(request: &Request) -> Result<()> {
    if request.user_id.trim().is_empty() {
        return Err(Error::Validation("user id must not be empty".into()));
    }
    let text = request.query_text();
    if text.trim().is_empty() {
        return Err(Error::Validation("query text must not be empty".into()));
    }
    if text.len() > 32_768 {
        return Err(Error::Validation("query text exceeds 32KiB".into()));
    }
    if let crate::types::RequestPayload::Search { max_results, .. } = &request.payload {
        if *max_results == 0 || *max_results > 50 {
            return Err(Error::Validation(
                "max_results must be between 1 and 50".into(),
            ));
        }
    }
    Ok(())
}
