//! Per-request mutable context owned by the executor.
//!
//! A [`GraphState`] lives exactly as long as one execution. Nodes receive it
//! by mutable reference and touch only the fields their descriptor declares;
//! the executor owns it before, between, and after nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::cache::LeaderGuard;
use crate::error::Error;
use crate::events::Timeline;
use crate::fingerprint::Fingerprint;
use crate::router::RouteDecision;
use crate::types::{
    ComplexityClass, Request, ResponseSummary, RetrievedDocument, StreamFrame, TaskType,
};

/// Bounded iterations of the research critic loop.
pub const MAX_CRITIC_ITERATIONS: u32 = 2;

/// Mutable state threaded through one graph execution.
pub struct GraphState {
    /// The request being served.
    pub request: Request,
    /// Event timeline, shared with the orchestrator.
    pub timeline: Arc<Timeline>,
    /// Complexity class, written by Plan.
    pub complexity: ComplexityClass,
    /// Request fingerprint, written by Plan.
    pub fingerprint: Option<Fingerprint>,
    /// Route choice, written by Route.
    pub decision: Option<RouteDecision>,
    /// Routes already attempted, for the one-shot fallback advance.
    pub routes_tried: Vec<String>,
    /// Retrieved documents, written by Retrieve.
    pub documents: Vec<RetrievedDocument>,
    /// Working synthesis, written by Synthesize.
    pub draft: Option<String>,
    /// Critic guidance for the next synthesis pass.
    pub critic_feedback: Option<String>,
    /// Whether the critic accepted the draft.
    pub critic_satisfied: bool,
    /// Critic loop iterations completed.
    pub iterations: u32,
    /// Final answer, written by Synthesize / CacheLookup / ErrorRecovery.
    pub answer: Option<String>,
    /// Models invoked, in order.
    pub models_used: Vec<String>,
    /// Node names in execution order.
    pub nodes_visited: Vec<String>,
    /// Spend units accumulated.
    pub cost_accumulated: f64,
    /// Tokens accumulated.
    pub tokens_used: u64,
    /// Cache hits observed during execution.
    pub cache_hits: u32,
    /// Whether the answer came straight from cache.
    pub cache_hit: bool,
    /// Whether the answer is degraded (fallbacks or recovery).
    pub degraded: bool,
    /// Error captured for the recovery node.
    pub error: Option<Error>,
    /// Execution start.
    pub started: Instant,
    /// Absolute deadline inherited by every node and backend call.
    pub deadline: Instant,
    /// Delta sink for streaming requests; `None` for buffered execution.
    pub chunk_tx: Option<mpsc::Sender<StreamFrame>>,
    /// Whether Synthesize already streamed deltas to the sink.
    pub streamed: bool,
    /// Single-flight leadership for this request's fingerprint. Held from
    /// the cache miss until CacheStore or ErrorRecovery completes it;
    /// dropping it unfinished (cancellation) releases waiters.
    pub flight: Option<LeaderGuard>,
}

impl GraphState {
    /// Build state for a request with an end-to-end deadline.
    #[must_use]
    pub fn new(request: Request, overall_deadline: Duration) -> Self {
        let started = Instant::now();
        let timeline = Arc::new(Timeline::new(request.id));
        Self {
            request,
            timeline,
            complexity: ComplexityClass::Standard,
            fingerprint: None,
            decision: None,
            routes_tried: Vec::new(),
            documents: Vec::new(),
            draft: None,
            critic_feedback: None,
            critic_satisfied: false,
            iterations: 0,
            answer: None,
            models_used: Vec::new(),
            nodes_visited: Vec::new(),
            cost_accumulated: 0.0,
            tokens_used: 0,
            cache_hits: 0,
            cache_hit: false,
            degraded: false,
            error: None,
            started,
            deadline: started + overall_deadline,
            chunk_tx: None,
            streamed: false,
            flight: None,
        }
    }

    /// The task type of the underlying request.
    #[must_use]
    pub fn task(&self) -> TaskType {
        self.request.task_type()
    }

    /// Time left before the request deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn past_deadline(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Milliseconds since execution started.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Build the response summary from the current state.
    #[must_use]
    pub fn summary(&self) -> ResponseSummary {
        ResponseSummary {
            correlation_id: self.request.id,
            models_used: self.models_used.clone(),
            cost: self.cost_accumulated,
            tokens_used: self.tokens_used,
            cache_hit: self.cache_hit,
            latency_ms: self.elapsed_ms(),
            degraded: self.degraded,
        }
    }
}
