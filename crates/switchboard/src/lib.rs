// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Switchboard: adaptive LLM orchestration core
//!
//! Switchboard routes chat, search, and deep-research requests across a
//! pool of local language-model backends. Every request runs through a
//! compiled workflow graph whose nodes consult a two-tier cache, pick a
//! route with a Thompson-sampling bandit under hard cost/quality/latency
//! constraints, and invoke pooled, health-checked backends. Sliding-window
//! rate limiting and monthly budget accounting sit in front, and a reward
//! signal feeds the bandit after completion.
//!
//! # Architecture
//!
//! ```text
//! request ──► Orchestrator ──► rate / budget / backpressure admission
//!                 │
//!                 ▼
//!           CompiledGraph (per task type, compiled once)
//!     plan → cache_lookup → route → [retrieve] → synthesize → [critic]
//!                 │                                   │
//!                 └── hit ──► emit ◄── cache_store ◄──┘
//!                 │
//!                 ▼
//!        reward → ThompsonBandit        cost → BudgetLedger
//! ```
//!
//! The components are plain values constructed at startup and handed to
//! the executor through [`graph::NodeContext`]; there are no module-level
//! singletons. The HTTP surface lives in `switchboard-server`, the backend
//! protocol client in `switchboard-ollama`, and the Redis L2 store in
//! `switchboard-redis`.

pub mod backend;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod graph;
pub mod limits;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod router;
pub mod search;
pub mod session;
pub mod types;

pub use backend::{BackendClient, ChunkStream, GenerateChunk, GenerateRequest, GenerateResponse};
pub use cache::{CacheEntry, CacheStore, MemoryStore, TieredCache};
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use fingerprint::{fingerprint_request, Fingerprint};
pub use graph::{CompiledGraph, Executor, Graph, GraphState, NodeContext};
pub use limits::{BudgetLedger, SlidingWindowLimiter};
pub use metrics::GatewayMetrics;
pub use orchestrator::Orchestrator;
pub use pool::{BackendPool, Endpoint, TaskClass};
pub use router::{AdaptiveRouter, RouteTable, ThompsonBandit};
pub use search::{SearchProvider, SearchQuery, StaticSearchProvider};
pub use session::SessionStore;
pub use types::{
    GatewayResponse, Request, RequestPayload, ResponseSummary, StreamFrame, TaskType, UserTier,
};
