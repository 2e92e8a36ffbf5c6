//! Structural robustness of the reasoning graph.
//!
//! Only vertical edges (Decompose, Derive) carry support from the goal
//! down to conclusions, so the analyzers work on that sub-graph:
//!
//! ```text
//!        Goal                 Goal
//!        │                   ╱    ╲
//!        A         vs.      A      B
//!        │                   ╲    ╱
//!       Leaf                  Leaf
//!
//!  critical (cut set {A})   redundant (no single-node cut)
//! ```
//!
//! [`PathAnalyzer`] enumerates goal-to-leaf paths and classifies them;
//! [`SensitivityAnalyzer`] perturbs node confidences on top of the same
//! path set.

pub mod paths;
pub mod sensitivity;

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::graph::{EdgeKind, GraphSnapshot, NodeId, NodeKind};

pub use paths::{
    Bottleneck, CriticalPath, PathAnalyzer, PathClassification, PathFailure, PathKind, PathReport,
    PathStatistics, RedundantPath, StructuralClass,
};
pub use sensitivity::{
    NodeFailure, NodeSensitivity, Priority, Recommendation, RecommendationKind,
    SensitivityAnalyzer, SensitivityReport,
};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("graph has no goal node")]
    MissingGoal,

    #[error("node {0} is not in the structural graph")]
    UnknownNode(NodeId),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Structural view of a session graph rooted at its goal.
#[derive(Debug, Clone)]
pub struct ReasoningGraph {
    goal: NodeId,
    order: Vec<NodeId>,
    confidence: HashMap<NodeId, Option<f64>>,
    children: HashMap<NodeId, Vec<NodeId>>,
    graph: DiGraph<NodeId, EdgeKind>,
    index: HashMap<NodeId, NodeIndex>,
}

impl ReasoningGraph {
    /// Graph holding only the goal.
    pub fn new(goal: &str) -> Self {
        let mut g = Self {
            goal: goal.to_string(),
            order: Vec::new(),
            confidence: HashMap::new(),
            children: HashMap::new(),
            graph: DiGraph::new(),
            index: HashMap::new(),
        };
        g.ensure(goal);
        g
    }

    /// Structural view of a snapshot. Horizontal edges are ignored.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> AnalysisResult<Self> {
        let goal = snapshot.goal().ok_or(AnalysisError::MissingGoal)?;
        let mut g = Self::new(&goal.id);
        // Constraints bound the search; they are not reasoning steps.
        for node in snapshot.nodes.iter().filter(|n| n.kind() != NodeKind::Constraint) {
            g.add_node(&node.id, Some(node.confidence));
        }
        for edge in &snapshot.edges {
            if g.contains(&edge.source_id) && g.contains(&edge.target_id) {
                g.add_edge(&edge.source_id, &edge.target_id, edge.kind);
            }
        }
        Ok(g)
    }

    fn ensure(&mut self, id: &str) -> NodeIndex {
        if let Some(ix) = self.index.get(id) {
            return *ix;
        }
        let ix = self.graph.add_node(id.to_string());
        self.index.insert(id.to_string(), ix);
        self.order.push(id.to_string());
        self.confidence.insert(id.to_string(), None);
        ix
    }

    /// Add or update a node. `None` confidence uses the analyzer default.
    pub fn add_node(&mut self, id: &str, confidence: Option<f64>) -> &mut Self {
        self.ensure(id);
        self.confidence.insert(id.to_string(), confidence);
        self
    }

    /// Add an edge; horizontal kinds are dropped. Unknown endpoints are
    /// created without a confidence.
    pub fn add_edge(&mut self, source: &str, target: &str, kind: EdgeKind) -> &mut Self {
        if !kind.is_vertical() || source == target {
            return self;
        }
        let (s, t) = (self.ensure(source), self.ensure(target));
        self.graph.add_edge(s, t, kind);
        let kids = self.children.entry(source.to_string()).or_default();
        if !kids.iter().any(|k| k == target) {
            kids.push(target.to_string());
        }
        self
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Node ids in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn confidence(&self, id: &str) -> Option<f64> {
        self.confidence.get(id).copied().flatten()
    }

    pub fn children(&self, id: &str) -> &[NodeId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes reachable from the goal through structural edges.
    pub fn reachable(&self) -> HashSet<NodeId> {
        let mut seen = HashSet::from([self.goal.clone()]);
        let mut queue = VecDeque::from([self.goal.clone()]);
        while let Some(id) = queue.pop_front() {
            for child in self.children(&id) {
                if seen.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }
        seen
    }

    /// Reachable non-goal nodes without structural children.
    pub fn leaves(&self) -> Vec<NodeId> {
        let reachable = self.reachable();
        self.order
            .iter()
            .filter(|id| **id != self.goal && reachable.contains(*id) && self.children(id).is_empty())
            .cloned()
            .collect()
    }

    pub(crate) fn petgraph(&self) -> &DiGraph<NodeId, EdgeKind> {
        &self.graph
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, MemoryGraphStore, GraphStore, Node, NodeContent};
    use crate::lock::{HolderKind, LockToken};

    #[test]
    fn test_from_snapshot_keeps_vertical_edges() {
        let store = MemoryGraphStore::new();
        let (goal, main) = store.create_session("s1", "decide").unwrap();
        let token = LockToken::issue(&main.id, "agent-1", HolderKind::Agent);

        let a = store
            .upsert_node(
                &token,
                Node::new("s1", NodeContent::claim("a"), 1).with_branch(&main.id),
            )
            .unwrap();
        let b = store
            .upsert_node(
                &token,
                Node::new("s1", NodeContent::claim("b"), 1).with_branch(&main.id),
            )
            .unwrap();
        store
            .upsert_edge(&token, Edge::new("s1", &goal.id, &a.id, EdgeKind::Decompose).unwrap())
            .unwrap();
        store
            .upsert_edge(&token, Edge::new("s1", &a.id, &b.id, EdgeKind::Attack).unwrap())
            .unwrap();

        let g = ReasoningGraph::from_snapshot(&store.snapshot("s1").unwrap()).unwrap();
        assert_eq!(g.goal(), goal.id);
        assert_eq!(g.children(&goal.id), &[a.id.clone()]);
        assert!(g.children(&a.id).is_empty());
        // `b` hangs off a horizontal edge only, so it supports nothing.
        assert_eq!(g.leaves(), vec![a.id.clone()]);
        assert_eq!(g.confidence(&a.id), Some(0.5));
    }

    #[test]
    fn test_from_snapshot_drops_constraint_edges() {
        let store = MemoryGraphStore::new();
        let (goal, main) = store.create_session("s1", "decide").unwrap();
        let token = LockToken::issue(&main.id, "agent-1", HolderKind::Agent);

        let limit = store
            .upsert_node(
                &token,
                Node::new(
                    "s1",
                    NodeContent::Constraint {
                        text: "must be cheap".to_string(),
                        hard: true,
                    },
                    1,
                )
                .with_branch(&main.id),
            )
            .unwrap();
        let claim = store
            .upsert_node(&token, Node::new("s1", NodeContent::claim("use sqlite"), 1).with_branch(&main.id))
            .unwrap();
        for target in [&limit.id, &claim.id] {
            store
                .upsert_edge(&token, Edge::new("s1", &goal.id, target, EdgeKind::Decompose).unwrap())
                .unwrap();
        }

        let g = ReasoningGraph::from_snapshot(&store.snapshot("s1").unwrap()).unwrap();
        assert!(!g.contains(&limit.id));
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.children(&goal.id), &[claim.id.clone()]);
        assert_eq!(g.leaves(), vec![claim.id.clone()]);
    }

    #[test]
    fn test_unreachable_nodes_are_not_leaves() {
        let mut g = ReasoningGraph::new("g");
        g.add_edge("g", "a", EdgeKind::Decompose)
            .add_edge("orphan", "b", EdgeKind::Derive);
        assert_eq!(g.leaves(), vec!["a".to_string()]);
        assert!(!g.reachable().contains("orphan"));
        assert!(!g.reachable().contains("b"));
    }

    #[test]
    fn test_builder_dedupes_edges() {
        let mut g = ReasoningGraph::new("g");
        g.add_edge("g", "a", EdgeKind::Decompose)
            .add_edge("g", "a", EdgeKind::Derive)
            .add_edge("a", "a", EdgeKind::Derive);
        assert_eq!(g.children("g").len(), 1);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.confidence("a"), None);
        assert!(ReasoningGraph::new("g").leaves().is_empty());
    }
}
