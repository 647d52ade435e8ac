//! Workflow graph executor.
//!
//! Per-request pipelines are statically declared DAGs of typed nodes with
//! predicate-guarded edges, compiled once per process and executed by the
//! [`Executor`] against a per-request [`GraphState`]. Streaming requests
//! flow word-grouped chunks out of the Synthesize node; cancellation and
//! deadlines propagate into every node and backend call.

mod builders;
mod executor;
mod nodes;
mod spec;
mod state;
mod stream;

pub use builders::{chat_graph, research_graph, search_graph};
pub use executor::{Executor, NodeStatus};
pub use nodes::{CachedAnswer, NodeContext, SAFE_FALLBACK_ANSWER};
pub use spec::{
    CompiledGraph, EdgePredicate, Graph, NodeDescriptor, NodeId, NodeKind, StateField, Target,
    END,
};
pub use state::{GraphState, MAX_CRITIC_ITERATIONS};
pub use stream::ChunkPacer;
