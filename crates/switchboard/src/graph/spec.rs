// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph structure: node descriptors, edges, and compilation.
//!
//! Graphs are flat arrays of node descriptors addressed by integer index;
//! edges hold indices, not references, so a compiled graph is a plain
//! immutable arena the executor walks. Nodes carry a kind tag the executor
//! dispatches on, plus declared read/write sets and a timeout.
//!
//! A graph compiles at most once: `compile()` freezes and validates the
//! structure, and calling it again returns the same compiled artifact.
//! Cycles are rejected unless the back-edge leaves a Critic node, whose
//! iteration counter bounds the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::graph::state::GraphState;

/// Sentinel edge target ending the execution.
pub const END: &str = "__end__";

/// Index of a node within its graph.
pub type NodeId = usize;

/// The built-in node kinds the executor dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Classify the query and fingerprint the request.
    Plan,
    /// Consult the cache; short-circuits to Emit on a hit.
    CacheLookup,
    /// Select a route via the adaptive router.
    Route,
    /// Fan out to search providers.
    Retrieve,
    /// Call the backend with the constructed prompt.
    Synthesize,
    /// Evaluate the draft with a second route; may loop to Synthesize.
    Critic,
    /// Write the successful output to cache.
    CacheStore,
    /// Finalize the response.
    Emit,
    /// Produce a graceful degraded answer after failures.
    ErrorRecovery,
}

/// State fields a node may read or write, declared in its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateField {
    /// `complexity` and `fingerprint`.
    Classification,
    /// `decision` and `routes_tried`.
    Decision,
    /// `documents`.
    Documents,
    /// `draft`, `critic_feedback`, `critic_satisfied`, `iterations`.
    Draft,
    /// `answer`, `cache_hit`, `degraded`.
    Answer,
    /// `models_used`, `cost_accumulated`, `tokens_used`.
    Accounting,
}

/// Static description of one node.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    /// Unique name within the graph.
    pub name: &'static str,
    /// Dispatch tag.
    pub kind: NodeKind,
    /// Fields the node reads.
    pub reads: &'static [StateField],
    /// Fields the node writes.
    pub writes: &'static [StateField],
    /// Per-node timeout, clipped by the request deadline.
    pub timeout: Duration,
}

/// Predicate guarding a conditional edge.
pub type EdgePredicate = fn(&GraphState) -> bool;

#[derive(Debug, Clone)]
struct PendingEdge {
    from: &'static str,
    to: &'static str,
    label: &'static str,
    predicate: Option<EdgePredicate>,
}

/// A resolved edge target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Continue at this node.
    Node(NodeId),
    /// Finish the execution.
    End,
}

#[derive(Debug, Clone)]
struct ResolvedEdge {
    label: &'static str,
    predicate: Option<EdgePredicate>,
    target: Target,
}

impl std::fmt::Debug for GraphInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphInner")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

struct GraphInner {
    name: &'static str,
    nodes: Vec<NodeDescriptor>,
    edges: Vec<Vec<ResolvedEdge>>,
    entry: NodeId,
    recovery: Option<NodeId>,
}

/// An immutable, validated graph ready for execution.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    inner: Arc<GraphInner>,
}

impl CompiledGraph {
    /// Graph name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// The entry node.
    #[must_use]
    pub fn entry(&self) -> NodeId {
        self.inner.entry
    }

    /// The recovery node, if declared.
    #[must_use]
    pub fn recovery(&self) -> Option<NodeId> {
        self.inner.recovery
    }

    /// Descriptor of a node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &NodeDescriptor {
        &self.inner.nodes[id]
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Whether the graph has no nodes (never true once compiled).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    /// The target after `from` completes: the first conditional edge whose
    /// predicate holds, else the unconditional default.
    ///
    /// # Errors
    ///
    /// [`Error::Graph`] when no edge applies, which indicates a build bug
    /// the compile-time validation could not see (all-conditional edge sets).
    pub fn next(&self, from: NodeId, state: &GraphState) -> Result<Target> {
        for edge in &self.inner.edges[from] {
            match edge.predicate {
                Some(pred) if pred(state) => {
                    tracing::trace!(
                        graph = self.inner.name,
                        from = self.inner.nodes[from].name,
                        edge = edge.label,
                        "conditional edge taken"
                    );
                    return Ok(edge.target);
                }
                Some(_) => continue,
                None => return Ok(edge.target),
            }
        }
        Err(Error::Graph {
            node: self.inner.nodes[from].name.to_string(),
            detail: "no outgoing edge applies".to_string(),
        })
    }
}

/// Graph under construction.
pub struct Graph {
    name: &'static str,
    nodes: Vec<NodeDescriptor>,
    by_name: HashMap<&'static str, NodeId>,
    pending: Vec<PendingEdge>,
    entry: Option<&'static str>,
    recovery: Option<&'static str>,
    compiled: Option<CompiledGraph>,
}

impl Graph {
    /// Start an empty graph.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            nodes: Vec::new(),
            by_name: HashMap::new(),
            pending: Vec::new(),
            entry: None,
            recovery: None,
            compiled: None,
        }
    }

    /// Add a node. Duplicate names are a compile-time error.
    pub fn add_node(&mut self, descriptor: NodeDescriptor) -> NodeId {
        let id = self.nodes.len();
        self.by_name.insert(descriptor.name, id);
        self.nodes.push(descriptor);
        id
    }

    /// Declare the entry node.
    pub fn set_entry_point(&mut self, name: &'static str) {
        self.entry = Some(name);
    }

    /// Declare the recovery node failures route to.
    pub fn set_recovery(&mut self, name: &'static str) {
        self.recovery = Some(name);
    }

    /// Add an unconditional edge. `to` may be [`END`].
    pub fn add_edge(&mut self, from: &'static str, to: &'static str) {
        self.pending.push(PendingEdge {
            from,
            to,
            label: "",
            predicate: None,
        });
    }

    /// Add a predicate-guarded edge, evaluated before later edges.
    pub fn add_conditional_edge(
        &mut self,
        from: &'static str,
        label: &'static str,
        predicate: EdgePredicate,
        to: &'static str,
    ) {
        self.pending.push(PendingEdge {
            from,
            to,
            label,
            predicate: Some(predicate),
        });
    }

    /// Freeze and validate the graph.
    ///
    /// Compiling twice is a no-op returning the first artifact.
    ///
    /// # Errors
    ///
    /// [`Error::Graph`] for duplicate node names, unknown edge endpoints, a
    /// missing entry point, nodes that cannot reach [`END`], or cycles not
    /// anchored at a Critic node.
    pub fn compile(&mut self) -> Result<CompiledGraph> {
        if let Some(compiled) = &self.compiled {
            return Ok(compiled.clone());
        }

        if self.by_name.len() != self.nodes.len() {
            return Err(self.build_error("duplicate node names"));
        }
        let entry_name = self
            .entry
            .ok_or_else(|| self.build_error("entry point not set"))?;
        let entry = *self
            .by_name
            .get(entry_name)
            .ok_or_else(|| self.build_error("entry point names an unknown node"))?;
        let recovery = match self.recovery {
            Some(name) => Some(
                *self
                    .by_name
                    .get(name)
                    .ok_or_else(|| self.build_error("recovery names an unknown node"))?,
            ),
            None => None,
        };

        let mut edges: Vec<Vec<ResolvedEdge>> = vec![Vec::new(); self.nodes.len()];
        for pending in &self.pending {
            let from = *self
                .by_name
                .get(pending.from)
                .ok_or_else(|| self.build_error("edge from unknown node"))?;
            let target = if pending.to == END {
                Target::End
            } else {
                Target::Node(
                    *self
                        .by_name
                        .get(pending.to)
                        .ok_or_else(|| self.build_error("edge to unknown node"))?,
                )
            };
            // Back-edges (loops) are only legal out of a Critic node, whose
            // iteration counter bounds them.
            if let Target::Node(to) = target {
                if to <= from && self.nodes[from].kind != NodeKind::Critic {
                    return Err(self.build_error("cycle not anchored at a critic node"));
                }
            }
            edges[from].push(ResolvedEdge {
                label: pending.label,
                predicate: pending.predicate,
                target,
            });
        }

        // Every node needs a way forward, and all-conditional edge sets are
        // rejected so `next()` is total at runtime.
        for (id, node_edges) in edges.iter().enumerate() {
            if node_edges.is_empty() {
                return Err(Error::Graph {
                    node: self.nodes[id].name.to_string(),
                    detail: "node has no outgoing edge".to_string(),
                });
            }
            let has_default = node_edges.iter().any(|e| e.predicate.is_none());
            if !has_default {
                return Err(Error::Graph {
                    node: self.nodes[id].name.to_string(),
                    detail: "node has only conditional edges".to_string(),
                });
            }
        }

        let compiled = CompiledGraph {
            inner: Arc::new(GraphInner {
                name: self.name,
                nodes: self.nodes.clone(),
                edges,
                entry,
                recovery,
            }),
        };
        self.compiled = Some(compiled.clone());
        tracing::debug!(graph = self.name, nodes = self.nodes.len(), "graph compiled");
        Ok(compiled)
    }

    fn build_error(&self, detail: &str) -> Error {
        Error::Graph {
            node: self.name.to_string(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &'static str, kind: NodeKind) -> NodeDescriptor {
        NodeDescriptor {
            name,
            kind,
            reads: &[],
            writes: &[],
            timeout: Duration::from_secs(5),
        }
    }

    fn two_node_graph() -> Graph {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("a", NodeKind::Plan));
        graph.add_node(descriptor("b", NodeKind::Emit));
        graph.set_entry_point("a");
        graph.add_edge("a", "b");
        graph.add_edge("b", END);
        graph
    }

    #[test]
    fn test_compile_and_walk() {
        let mut graph = two_node_graph();
        let compiled = graph.compile().unwrap();
        assert_eq!(compiled.entry(), 0);
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled.node(0).name, "a");
    }

    #[test]
    fn test_compile_twice_is_noop() {
        let mut graph = two_node_graph();
        let first = graph.compile().unwrap();
        let second = graph.compile().unwrap();
        // Same artifact, not a rebuilt one.
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("a", NodeKind::Plan));
        graph.add_edge("a", END);
        assert!(matches!(graph.compile(), Err(Error::Graph { .. })));
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("a", NodeKind::Plan));
        graph.set_entry_point("a");
        graph.add_edge("a", "ghost");
        assert!(matches!(graph.compile(), Err(Error::Graph { .. })));
    }

    #[test]
    fn test_dead_end_node_rejected() {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("a", NodeKind::Plan));
        graph.add_node(descriptor("b", NodeKind::Emit));
        graph.set_entry_point("a");
        graph.add_edge("a", "b");
        // "b" has no outgoing edge.
        assert!(matches!(graph.compile(), Err(Error::Graph { .. })));
    }

    #[test]
    fn test_cycle_from_non_critic_rejected() {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("a", NodeKind::Plan));
        graph.add_node(descriptor("b", NodeKind::Synthesize));
        graph.set_entry_point("a");
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");
        assert!(matches!(graph.compile(), Err(Error::Graph { .. })));
    }

    #[test]
    fn test_critic_loop_allowed() {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("synthesize", NodeKind::Synthesize));
        graph.add_node(descriptor("critic", NodeKind::Critic));
        graph.add_node(descriptor("emit", NodeKind::Emit));
        graph.set_entry_point("synthesize");
        graph.add_edge("synthesize", "critic");
        graph.add_conditional_edge("critic", "revise", |s| s.iterations < 2, "synthesize");
        graph.add_edge("critic", "emit");
        graph.add_edge("emit", END);
        assert!(graph.compile().is_ok());
    }

    #[test]
    fn test_all_conditional_edges_rejected() {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("a", NodeKind::Plan));
        graph.set_entry_point("a");
        graph.add_conditional_edge("a", "maybe", |_| false, END);
        assert!(matches!(graph.compile(), Err(Error::Graph { .. })));
    }

    #[test]
    fn test_conditional_edge_order() {
        let mut graph = Graph::new("test");
        graph.add_node(descriptor("a", NodeKind::CacheLookup));
        graph.add_node(descriptor("b", NodeKind::Route));
        graph.add_node(descriptor("c", NodeKind::Emit));
        graph.set_entry_point("a");
        graph.add_conditional_edge("a", "hit", |s| s.cache_hit, "c");
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", END);
        let compiled = graph.compile().unwrap();

        let mut state = crate::graph::state::GraphState::new(
            crate::types::Request::new(
                "u",
                crate::types::UserTier::Free,
                crate::types::RequestPayload::Chat {
                    history: vec![],
                    message: "hi".into(),
                },
            ),
            Duration::from_secs(5),
        );
        assert_eq!(compiled.next(0, &state).unwrap(), Target::Node(1));
        state.cache_hit = true;
        assert_eq!(compiled.next(0, &state).unwrap(), Target::Node(2));
    }
}
