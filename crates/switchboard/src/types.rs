//! Request, response, and classification types shared across the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription tier of the requesting user. Drives rate-limit caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    /// Unauthenticated caller, identified by IP.
    #[default]
    Anonymous,
    /// Free account.
    Free,
    /// Paid individual account.
    Pro,
    /// Organization account.
    Enterprise,
}

impl UserTier {
    /// Stable label used in metrics and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

/// Requested answer quality. Acts as a hard floor during route filtering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// Cheapest acceptable answer.
    Low,
    /// Balanced default.
    #[default]
    Standard,
    /// Best available model.
    High,
}

/// Depth of a research request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResearchDepth {
    /// Single retrieval pass, no critic.
    Shallow,
    /// Retrieval plus one critic pass.
    #[default]
    Standard,
    /// Full critic loop up to the iteration bound.
    Deep,
}

/// The three request pipelines the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Conversational completion.
    Chat,
    /// Web search with snippet synthesis.
    Search,
    /// Multi-stage deep research.
    Research,
}

impl TaskType {
    /// Stable label used in metrics, cache keys, and bandit buckets.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Search => "search",
            Self::Research => "research",
        }
    }
}

/// Complexity class of a query, derived by a cheap heuristic.
///
/// Partitions bandit learning and selects cache TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    /// Trivial queries (greetings, single facts).
    UltraFast,
    /// Typical single-turn questions.
    #[default]
    Standard,
    /// Analytical or multi-part questions.
    Detailed,
}

impl ComplexityClass {
    /// Stable label used in metrics, cache keys, and bandit buckets.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UltraFast => "ultra_fast",
            Self::Standard => "standard",
            Self::Detailed => "detailed",
        }
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
    /// System instruction.
    System,
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced the turn.
    pub role: Role,
    /// Turn text.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Convenience constructor for an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Convenience constructor for a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Optional per-request constraints applied during route filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Constraints {
    /// Monetary ceiling for this request, in spend units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Minimum acceptable answer quality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityLevel>,
    /// Latency target in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
}

/// Search-specific filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SearchFilters {
    /// Only results newer than this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recency_days: Option<u32>,
    /// Restrict results to these source domains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_sources: Vec<String>,
}

/// The payload of an incoming request, one shape per task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestPayload {
    /// Conversational completion.
    Chat {
        /// Prior turns, oldest first.
        #[serde(default)]
        history: Vec<ChatMessage>,
        /// Latest user message.
        message: String,
    },
    /// Web search.
    Search {
        /// Free-text query.
        query: String,
        /// Optional result filters.
        #[serde(default)]
        filters: SearchFilters,
        /// Maximum results to return.
        #[serde(default = "default_max_results")]
        max_results: usize,
    },
    /// Deep research.
    Research {
        /// The research question.
        question: String,
        /// Requested depth.
        #[serde(default)]
        depth: ResearchDepth,
    },
}

fn default_max_results() -> usize {
    10
}

/// A fully validated request entering the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request id, echoed as the correlation id.
    pub id: Uuid,
    /// Owning user (or IP for anonymous callers).
    pub user_id: String,
    /// Subscription tier.
    pub tier: UserTier,
    /// Session for best-effort history continuity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Task payload.
    pub payload: RequestPayload,
    /// Optional constraints.
    #[serde(default)]
    pub constraints: Constraints,
    /// Whether the caller wants a chunked stream.
    #[serde(default)]
    pub stream: bool,
}

impl Request {
    /// Build a request with a fresh id.
    #[must_use]
    pub fn new(user_id: impl Into<String>, tier: UserTier, payload: RequestPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            tier,
            session_id: None,
            payload,
            constraints: Constraints::default(),
            stream: false,
        }
    }

    /// The pipeline this request runs through.
    #[must_use]
    pub fn task_type(&self) -> TaskType {
        match self.payload {
            RequestPayload::Chat { .. } => TaskType::Chat,
            RequestPayload::Search { .. } => TaskType::Search,
            RequestPayload::Research { .. } => TaskType::Research,
        }
    }

    /// The text the complexity heuristic and fingerprint operate on.
    #[must_use]
    pub fn query_text(&self) -> &str {
        match &self.payload {
            RequestPayload::Chat { message, .. } => message,
            RequestPayload::Search { query, .. } => query,
            RequestPayload::Research { question, .. } => question,
        }
    }
}

/// A document retrieved from a search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    /// Result title.
    pub title: String,
    /// Source URL.
    pub url: String,
    /// Snippet or extracted text.
    pub snippet: String,
    /// Provider-assigned relevance, higher is better.
    pub score: f64,
}

/// Summary of a completed request, attached to buffered responses and the
/// final frame of streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSummary {
    /// Correlation id echoed in logs and metrics.
    pub correlation_id: Uuid,
    /// Models invoked, in order. Empty on a cache hit.
    pub models_used: Vec<String>,
    /// Actual spend-unit cost of the request.
    pub cost: f64,
    /// Total tokens consumed.
    pub tokens_used: u64,
    /// Whether the answer came from cache.
    pub cache_hit: bool,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// Whether fallbacks degraded the answer.
    pub degraded: bool,
}

/// A buffered gateway response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// The synthesized answer.
    pub answer: String,
    /// Retrieved citations, if the pipeline produced any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<RetrievedDocument>,
    /// Execution summary.
    #[serde(flatten)]
    pub summary: ResponseSummary,
}

/// One frame of a streaming response.
///
/// Frames with `done == false` carry a delta; the final frame carries the
/// summary and is always delivered last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Word-grouped text delta. Empty on the final frame.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delta: String,
    /// Terminal marker.
    pub done: bool,
    /// Present only on the final frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ResponseSummary>,
}

impl StreamFrame {
    /// A delta frame.
    #[must_use]
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            done: false,
            summary: None,
        }
    }

    /// The terminal frame.
    #[must_use]
    pub fn done(summary: ResponseSummary) -> Self {
        Self {
            delta: String::new(),
            done: true,
            summary: Some(summary),
        }
    }
}

/// Wall-clock timestamp helper used by ledgers and arm state.
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
