// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The graph executor: walks a compiled graph over one request's state.
//!
//! Per node the lifecycle is PENDING → READY → RUNNING → {DONE, FAILED,
//! TIMED_OUT, CANCELLED}. A failed or timed-out node routes execution to the
//! graph's recovery node (once). A cancelled node ends the execution
//! immediately: nothing runs after a CANCELLED terminal, the bandit is not
//! updated, and no cache write happens (CacheStore refuses cancelled state).
//! Every node runs under the smaller of its declared timeout and the
//! request deadline.

use std::sync::Arc;
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::graph::nodes::{
    run_cache_lookup, run_cache_store, run_critic, run_emit, run_error_recovery, run_plan,
    run_retrieve, run_route, run_synthesize, NodeContext,
};
use crate::graph::spec::{CompiledGraph, NodeKind, Target};
use crate::graph::state::GraphState;

/// Terminal status of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Completed normally.
    Done,
    /// Returned an error.
    Failed,
    /// Exceeded its timeout.
    TimedOut,
    /// Cancelled mid-flight.
    Cancelled,
}

impl NodeStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Executes compiled graphs against per-request state.
pub struct Executor {
    ctx: Arc<NodeContext>,
}

impl Executor {
    /// Build an executor over the shared component context.
    #[must_use]
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// The component context.
    #[must_use]
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Run the graph to completion, mutating and returning the state.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] on cancellation; otherwise the terminal error
    /// when recovery is unavailable or recovery itself failed.
    pub async fn invoke(
        &self,
        graph: &CompiledGraph,
        mut state: GraphState,
        cancel: &CancelToken,
    ) -> Result<GraphState> {
        let mut current = graph.entry();
        let mut recovered = false;

        loop {
            if cancel.is_cancelled() {
                state.timeline.record(EventKind::Cancelled);
                return Err(Error::Cancelled);
            }

            let node = graph.node(current).clone();
            state.nodes_visited.push(node.name.to_string());
            state.timeline.record(EventKind::NodeStarted {
                node: node.name.to_string(),
            });
            let node_started = Instant::now();

            // Deadline already blown: skip straight to the timeout path.
            let (status, error) = if state.past_deadline() {
                (
                    NodeStatus::TimedOut,
                    Some(Error::BackendTimeout {
                        timeout_ms: state.elapsed_ms(),
                    }),
                )
            } else {
                let budget = node.timeout.min(state.remaining());
                let run = self.run_node(node.kind, &mut state, cancel);
                match tokio::time::timeout(budget, run).await {
                    Ok(Ok(())) => (NodeStatus::Done, None),
                    Ok(Err(Error::Cancelled)) => (NodeStatus::Cancelled, Some(Error::Cancelled)),
                    Ok(Err(e)) => (NodeStatus::Failed, Some(e)),
                    Err(_) => (
                        NodeStatus::TimedOut,
                        Some(Error::BackendTimeout {
                            timeout_ms: budget.as_millis() as u64,
                        }),
                    ),
                }
            };

            state.timeline.record(EventKind::NodeFinished {
                node: node.name.to_string(),
                status: status.as_str().to_string(),
                duration_ms: node_started.elapsed().as_millis() as u64,
            });

            match status {
                NodeStatus::Done => match graph.next(current, &state)? {
                    Target::Node(next) => current = next,
                    Target::End => return Ok(state),
                },
                NodeStatus::Cancelled => {
                    state.timeline.record(EventKind::Cancelled);
                    return Err(Error::Cancelled);
                }
                NodeStatus::Failed | NodeStatus::TimedOut => {
                    let err = error.unwrap_or_else(|| Error::Internal("node failed".into()));
                    // Constraint and validation errors surface immediately;
                    // recovery is for transient execution failures.
                    if matches!(err, Error::Validation(_)) {
                        return Err(err);
                    }
                    tracing::warn!(
                        graph = graph.name(),
                        node = node.name,
                        status = status.as_str(),
                        error = %err,
                        "node failed, routing to recovery"
                    );
                    match graph.recovery() {
                        // Recovery runs at most once; a failure inside
                        // recovery propagates.
                        Some(recovery) if !recovered && node.kind != NodeKind::ErrorRecovery => {
                            recovered = true;
                            state.error = Some(err);
                            current = recovery;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    async fn run_node(
        &self,
        kind: NodeKind,
        state: &mut GraphState,
        cancel: &CancelToken,
    ) -> Result<()> {
        match kind {
            NodeKind::Plan => run_plan(&self.ctx, state, cancel).await,
            NodeKind::CacheLookup => run_cache_lookup(&self.ctx, state, cancel).await,
            NodeKind::Route => run_route(&self.ctx, state, cancel).await,
            NodeKind::Retrieve => run_retrieve(&self.ctx, state, cancel).await,
            NodeKind::Synthesize => run_synthesize(&self.ctx, state, cancel).await,
            NodeKind::Critic => run_critic(&self.ctx, state, cancel).await,
            NodeKind::CacheStore => run_cache_store(&self.ctx, state, cancel).await,
            NodeKind::Emit => run_emit(&self.ctx, state, cancel).await,
            NodeKind::ErrorRecovery => run_error_recovery(&self.ctx, state, cancel).await,
        }
    }
}
