//! Statically declared graphs for the three task types.
//!
//! Each graph is built and compiled once per process; the orchestrator
//! memoizes the compiled artifacts behind `OnceLock`s and `compile()` itself
//! is idempotent, so a second build attempt cannot produce a divergent
//! graph.

use std::time::Duration;

use crate::error::Result;
use crate::graph::spec::{
    CompiledGraph, Graph, NodeDescriptor, NodeKind, StateField, END,
};
use crate::graph::state::{GraphState, MAX_CRITIC_ITERATIONS};
use crate::types::{RequestPayload, ResearchDepth};

fn plan() -> NodeDescriptor {
    NodeDescriptor {
        name: "plan",
        kind: NodeKind::Plan,
        reads: &[],
        writes: &[StateField::Classification],
        timeout: Duration::from_secs(2),
    }
}

fn cache_lookup() -> NodeDescriptor {
    NodeDescriptor {
        name: "cache_lookup",
        kind: NodeKind::CacheLookup,
        reads: &[StateField::Classification],
        writes: &[StateField::Answer],
        // A single-flight follower waits here for the in-flight producer,
        // which can take as long as a full synthesis. The request deadline
        // still bounds the wait.
        timeout: Duration::from_secs(150),
    }
}

fn route() -> NodeDescriptor {
    NodeDescriptor {
        name: "route",
        kind: NodeKind::Route,
        reads: &[StateField::Classification],
        writes: &[StateField::Decision],
        timeout: Duration::from_secs(2),
    }
}

fn retrieve() -> NodeDescriptor {
    NodeDescriptor {
        name: "retrieve",
        kind: NodeKind::Retrieve,
        reads: &[StateField::Classification],
        writes: &[StateField::Documents],
        timeout: Duration::from_secs(15),
    }
}

fn synthesize() -> NodeDescriptor {
    NodeDescriptor {
        name: "synthesize",
        kind: NodeKind::Synthesize,
        reads: &[StateField::Decision, StateField::Documents, StateField::Draft],
        writes: &[StateField::Draft, StateField::Answer, StateField::Accounting],
        // The pool enforces the per-class call timeout; this only bounds a
        // wedged node.
        timeout: Duration::from_secs(150),
    }
}

fn critic() -> NodeDescriptor {
    NodeDescriptor {
        name: "critic",
        kind: NodeKind::Critic,
        reads: &[StateField::Draft],
        writes: &[StateField::Draft, StateField::Accounting],
        timeout: Duration::from_secs(60),
    }
}

fn cache_store() -> NodeDescriptor {
    NodeDescriptor {
        name: "cache_store",
        kind: NodeKind::CacheStore,
        reads: &[StateField::Classification, StateField::Answer],
        writes: &[],
        timeout: Duration::from_secs(5),
    }
}

fn emit() -> NodeDescriptor {
    NodeDescriptor {
        name: "emit",
        kind: NodeKind::Emit,
        reads: &[StateField::Answer],
        writes: &[],
        timeout: Duration::from_secs(5),
    }
}

fn error_recovery() -> NodeDescriptor {
    NodeDescriptor {
        name: "error_recovery",
        kind: NodeKind::ErrorRecovery,
        reads: &[StateField::Draft],
        writes: &[StateField::Answer],
        timeout: Duration::from_secs(5),
    }
}

fn cache_hit(state: &GraphState) -> bool {
    state.cache_hit
}

fn critic_wants_revision(state: &GraphState) -> bool {
    !state.critic_satisfied && state.iterations < MAX_CRITIC_ITERATIONS
}

fn skip_critic(state: &GraphState) -> bool {
    matches!(
        state.request.payload,
        RequestPayload::Research {
            depth: ResearchDepth::Shallow,
            ..
        }
    )
}

/// The chat pipeline: plan → cache → route → synthesize → store → emit.
///
/// # Errors
///
/// Propagates graph validation failures (a build bug, not a runtime state).
pub fn chat_graph() -> Result<CompiledGraph> {
    let mut graph = Graph::new("chat");
    graph.add_node(plan());
    graph.add_node(cache_lookup());
    graph.add_node(route());
    graph.add_node(synthesize());
    graph.add_node(cache_store());
    graph.add_node(emit());
    graph.add_node(error_recovery());

    graph.set_entry_point("plan");
    graph.set_recovery("error_recovery");
    graph.add_edge("plan", "cache_lookup");
    graph.add_conditional_edge("cache_lookup", "hit", cache_hit, "emit");
    graph.add_edge("cache_lookup", "route");
    graph.add_edge("route", "synthesize");
    graph.add_edge("synthesize", "cache_store");
    graph.add_edge("cache_store", "emit");
    graph.add_edge("emit", END);
    graph.add_edge("error_recovery", "emit");
    graph.compile()
}

/// The search pipeline adds a Retrieve fan-out before synthesis.
///
/// # Errors
///
/// Propagates graph validation failures.
pub fn search_graph() -> Result<CompiledGraph> {
    let mut graph = Graph::new("search");
    graph.add_node(plan());
    graph.add_node(cache_lookup());
    graph.add_node(route());
    graph.add_node(retrieve());
    graph.add_node(synthesize());
    graph.add_node(cache_store());
    graph.add_node(emit());
    graph.add_node(error_recovery());

    graph.set_entry_point("plan");
    graph.set_recovery("error_recovery");
    graph.add_edge("plan", "cache_lookup");
    graph.add_conditional_edge("cache_lookup", "hit", cache_hit, "emit");
    graph.add_edge("cache_lookup", "route");
    graph.add_edge("route", "retrieve");
    graph.add_edge("retrieve", "synthesize");
    graph.add_edge("synthesize", "cache_store");
    graph.add_edge("cache_store", "emit");
    graph.add_edge("emit", END);
    graph.add_edge("error_recovery", "emit");
    graph.compile()
}

/// The research pipeline adds the bounded critic loop: the critic sends the
/// draft back to Synthesize while unsatisfied and under the iteration
/// bound, then execution proceeds to storage either way.
///
/// # Errors
///
/// Propagates graph validation failures.
pub fn research_graph() -> Result<CompiledGraph> {
    let mut graph = Graph::new("research");
    graph.add_node(plan());
    graph.add_node(cache_lookup());
    graph.add_node(route());
    graph.add_node(retrieve());
    graph.add_node(synthesize());
    graph.add_node(critic());
    graph.add_node(cache_store());
    graph.add_node(emit());
    graph.add_node(error_recovery());

    graph.set_entry_point("plan");
    graph.set_recovery("error_recovery");
    graph.add_edge("plan", "cache_lookup");
    graph.add_conditional_edge("cache_lookup", "hit", cache_hit, "emit");
    graph.add_edge("cache_lookup", "route");
    graph.add_edge("route", "retrieve");
    graph.add_edge("retrieve", "synthesize");
    graph.add_conditional_edge("synthesize", "shallow", skip_critic, "cache_store");
    graph.add_edge("synthesize", "critic");
    graph.add_conditional_edge("critic", "revise", critic_wants_revision, "synthesize");
    graph.add_edge("critic", "cache_store");
    graph.add_edge("cache_store", "emit");
    graph.add_edge("emit", END);
    graph.add_edge("error_recovery", "emit");
    graph.compile()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_graphs_compile() {
        assert_eq!(chat_graph().unwrap().name(), "chat");
        assert_eq!(search_graph().unwrap().name(), "search");
        assert_eq!(research_graph().unwrap().name(), "research");
    }

    #[test]
    fn test_chat_graph_shape() {
        let graph = chat_graph().unwrap();
        assert_eq!(graph.node(graph.entry()).name, "plan");
        assert!(graph.recovery().is_some());
        assert_eq!(graph.len(), 7);
    }

    #[test]
    fn test_research_graph_has_critic() {
        let graph = research_graph().unwrap();
        let names: Vec<&str> = (0..graph.len()).map(|i| graph.node(i).name).collect();
        assert!(names.contains(&"critic"));
        assert!(names.contains(&"retrieve"));
    }
}
