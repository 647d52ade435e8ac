//! Per-request event timeline.
//!
//! Every request carries a [`Timeline`] that nodes and the orchestrator
//! append to. Events are mirrored to `tracing` with the correlation id so
//! log lines and the timeline agree; the timeline itself is returned to
//! callers that want to introspect a request (tests, debug endpoints).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// What happened at one point of a request's life.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Admission passed.
    Accepted,
    /// A node began executing.
    NodeStarted {
        /// Node name.
        node: String,
    },
    /// A node reached a terminal state.
    NodeFinished {
        /// Node name.
        node: String,
        /// Terminal status label.
        status: String,
        /// Time spent in the node.
        duration_ms: u64,
    },
    /// Cache lookup hit.
    CacheHit {
        /// L1 or L2.
        level: String,
    },
    /// Cache lookup missed.
    CacheMiss,
    /// The router chose a route.
    RouteChosen {
        /// Route name.
        route: String,
        /// Bucket label.
        bucket: String,
        /// Whether the exploration floor forced it.
        explored: bool,
    },
    /// The fallback chain advanced.
    FallbackUsed {
        /// Route that failed.
        from: String,
        /// Route now serving the request.
        to: String,
    },
    /// A backend call was issued.
    BackendCall {
        /// Endpoint URL.
        endpoint: String,
        /// Model invoked.
        model: String,
    },
    /// The answer was served degraded.
    Degraded {
        /// Why.
        reason: String,
    },
    /// The request finished.
    Completed {
        /// End-to-end latency.
        latency_ms: u64,
        /// Whether the answer came from cache.
        cache_hit: bool,
    },
    /// The request was cancelled.
    Cancelled,
}

/// A timestamped event.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Append-only event log for one request.
#[derive(Debug)]
pub struct Timeline {
    correlation_id: Uuid,
    events: Mutex<Vec<RequestEvent>>,
}

impl Timeline {
    /// Start a timeline for a request.
    #[must_use]
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            events: Mutex::new(Vec::new()),
        }
    }

    /// The request's correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Append an event and mirror it to the log.
    pub fn record(&self, kind: EventKind) {
        tracing::debug!(correlation_id = %self.correlation_id, event = ?kind, "request event");
        self.events.lock().push(RequestEvent {
            at: Utc::now(),
            kind,
        });
    }

    /// Snapshot the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<RequestEvent> {
        self.events.lock().clone()
    }

    /// Whether an event matching `predicate` was recorded.
    #[must_use]
    pub fn contains(&self, predicate: impl Fn(&EventKind) -> bool) -> bool {
        self.events.lock().iter().any(|e| predicate(&e.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeline_records_in_order() {
        let timeline = Timeline::new(Uuid::new_v4());
        timeline.record(EventKind::Accepted);
        timeline.record(EventKind::CacheMiss);
        timeline.record(EventKind::Completed {
            latency_ms: 12,
            cache_hit: false,
        });
        let events = timeline.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::Accepted);
        assert!(matches!(events[2].kind, EventKind::Completed { .. }));
    }

    #[test]
    fn test_contains() {
        let timeline = Timeline::new(Uuid::new_v4());
        timeline.record(EventKind::CacheHit { level: "l1".into() });
        assert!(timeline.contains(|e| matches!(e, EventKind::CacheHit { .. })));
        assert!(!timeline.contains(|e| matches!(e, EventKind::Cancelled)));
    }
}
