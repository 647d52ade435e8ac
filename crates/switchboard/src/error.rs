//! Error types for the Switchboard orchestration core.
//!
//! The variants here are surface-stable: the HTTP layer maps them to status
//! codes and the metrics layer labels counters with [`Error::kind`]. Transient
//! backend and cache failures are recovered locally (fallback chain, L1-only
//! degradation); constraint violations surface to the caller immediately.

use thiserror::Error;

/// Error type for all Switchboard operations.
///
/// `Clone` is intentional: single-flight followers receive the producer's
/// error verbatim, so every variant carries only cheaply clonable data.
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed or unprocessable request. Never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The identifier exceeded its sliding-window request cap.
    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until the oldest in-window request ages out.
        retry_after_seconds: u64,
    },

    /// The user's monthly spend cap is exhausted.
    #[error("monthly budget exceeded for user '{user_id}'")]
    BudgetExceeded {
        /// User whose ledger rejected the reservation.
        user_id: String,
    },

    /// Backend pool queues are saturated past the high watermark.
    #[error("gateway overloaded, retry with backoff")]
    Overloaded,

    /// No endpoint could serve the model within the queue timeout.
    #[error("no backend available for model '{model}'")]
    NoBackend {
        /// Model that could not be placed.
        model: String,
    },

    /// A backend call exceeded its task-class deadline.
    #[error("backend call timed out after {timeout_ms}ms")]
    BackendTimeout {
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The backend returned a protocol or transport error.
    #[error("backend error: {0}")]
    Backend(String),

    /// L2 cache unavailable or returned a corrupt payload. Logged, never
    /// surfaced to callers; requests continue L1-only.
    #[error("cache degraded: {0}")]
    CacheDegraded(String),

    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A workflow graph failed to compile or a node misbehaved.
    #[error("graph error in node '{node}': {detail}")]
    Graph {
        /// Node name, or the graph name for build-time failures.
        node: String,
        /// What went wrong.
        detail: String,
    },

    /// The client disconnected or the request deadline elapsed.
    #[error("request cancelled")]
    Cancelled,

    /// Unexpected failure; full detail goes to logs keyed by correlation id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable lowercase label for metrics and structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Overloaded => "overloaded",
            Self::NoBackend { .. } => "no_backend",
            Self::BackendTimeout { .. } => "backend_timeout",
            Self::Backend(_) => "backend_error",
            Self::CacheDegraded(_) => "cache_degraded",
            Self::Configuration(_) => "configuration_error",
            Self::Graph { .. } => "graph_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the fallback chain should advance after this failure.
    #[must_use]
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::BackendTimeout { .. } | Self::Backend(_) | Self::NoBackend { .. }
        )
    }

    /// Whether the caller may retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Overloaded | Self::BackendTimeout { .. } | Self::Backend(_)
        )
    }
}

/// Result type for all Switchboard operations.
pub type Result<T> = std::result::Result<T, Error>;
