//! Wire DTOs and the error-to-status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use switchboard::types::{
    ChatMessage, Constraints, GatewayResponse, ResearchDepth, RetrievedDocument, SearchFilters,
};
use switchboard::Error;

/// Body of `POST /chat/complete` and `POST /chat/stream`.
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    /// Latest user message.
    pub message: String,
    /// Session id for best-effort history continuity.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Optional explicit history; wins over the session buffer.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Optional constraints.
    #[serde(default)]
    pub constraints: Constraints,
}

/// Body of `POST /search/basic`.
#[derive(Debug, Deserialize)]
pub struct SearchBody {
    /// Free-text query.
    pub query: String,
    /// Maximum results to return.
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Optional result filters.
    #[serde(default)]
    pub filters: SearchFilters,
    /// Optional constraints.
    #[serde(default)]
    pub constraints: Constraints,
}

/// Body of `POST /research/deep-dive`.
#[derive(Debug, Deserialize)]
pub struct ResearchBody {
    /// The research question.
    pub research_question: String,
    /// Requested depth.
    #[serde(default)]
    pub depth: ResearchDepth,
    /// Optional constraints.
    #[serde(default)]
    pub constraints: Constraints,
}

/// Response of `POST /chat/complete`.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    /// The answer text.
    pub answer: String,
    /// Models invoked, empty on a cache hit.
    pub models_used: Vec<String>,
    /// Spend-unit cost.
    pub cost: f64,
    /// Whether the cache served the answer.
    pub cache_hit: bool,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Correlation id echoed in logs and metrics.
    pub correlation_id: Uuid,
    /// Whether fallbacks degraded the answer.
    pub degraded: bool,
}

impl From<GatewayResponse> for ChatResponse {
    fn from(response: GatewayResponse) -> Self {
        Self {
            answer: response.answer,
            models_used: response.summary.models_used,
            cost: response.summary.cost,
            cache_hit: response.summary.cache_hit,
            latency_ms: response.summary.latency_ms,
            correlation_id: response.summary.correlation_id,
            degraded: response.summary.degraded,
        }
    }
}

/// Response of `POST /search/basic` and `POST /research/deep-dive`.
#[derive(Debug, Serialize)]
pub struct SynthesisResponse {
    /// Synthesized answer.
    pub answer: String,
    /// Ranked sources with snippets.
    pub results: Vec<RetrievedDocument>,
    /// Models invoked.
    pub models_used: Vec<String>,
    /// Spend-unit cost.
    pub cost: f64,
    /// Whether the cache served the answer.
    pub cache_hit: bool,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Correlation id echoed in logs and metrics.
    pub correlation_id: Uuid,
    /// Whether the answer is degraded.
    pub degraded: bool,
}

impl From<GatewayResponse> for SynthesisResponse {
    fn from(response: GatewayResponse) -> Self {
        Self {
            answer: response.answer,
            results: response.citations,
            models_used: response.summary.models_used,
            cost: response.summary.cost,
            cache_hit: response.summary.cache_hit,
            latency_ms: response.summary.latency_ms,
            correlation_id: response.summary.correlation_id,
            degraded: response.summary.degraded,
        }
    }
}

/// Error body returned to clients. Internal detail stays in the logs.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable error kind label.
    pub error: String,
    /// Safe, human-readable message.
    pub message: String,
    /// Present only on 429 responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

/// Wraps core errors for axum responses.
pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match &self.0 {
            Error::Validation(detail) => (StatusCode::BAD_REQUEST, detail.clone(), None),
            Error::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded".to_string(),
                Some(*retry_after_seconds),
            ),
            Error::BudgetExceeded { .. } => (
                StatusCode::PAYMENT_REQUIRED,
                "monthly budget exhausted".to_string(),
                None,
            ),
            Error::Overloaded => (
                StatusCode::SERVICE_UNAVAILABLE,
                "gateway overloaded, retry with backoff".to_string(),
                None,
            ),
            Error::NoBackend { .. }
            | Error::BackendTimeout { .. }
            | Error::Backend(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no backend could serve the request".to_string(),
                None,
            ),
            // Full detail is in the logs keyed by correlation id; clients
            // get a generic message.
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
                None,
            ),
        };
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message,
            retry_after_seconds: retry_after,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (
                Error::RateLimited {
                    retry_after_seconds: 3,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::BudgetExceeded {
                    user_id: "u".into(),
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (Error::Overloaded, StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::Internal("secret detail".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
