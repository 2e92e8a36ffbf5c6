//! Graph store: atomic session snapshots and single-entity upserts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::*;
use super::{GraphError, GraphResult};
use crate::lock::LockToken;

/// Shared reference to a graph store
pub type SharedGraphStore = Arc<dyn GraphStore>;

/// Read/write access to the nodes, edges and branches of a session.
///
/// Node and edge writes take a [`LockToken`]. The store only checks that
/// the token names the branch being written; it does not consult the
/// coordination store. Whether the token is still live is the caller's
/// responsibility (`BranchLockService::verify`).
pub trait GraphStore: Send + Sync {
    /// Create a session with its Goal node and main branch.
    fn create_session(&self, session_id: &str, goal: &str) -> GraphResult<(Node, Branch)>;

    /// Consistent view of every node, edge and branch of a session.
    fn snapshot(&self, session_id: &str) -> GraphResult<GraphSnapshot>;

    fn get_node(&self, session_id: &str, node_id: &str) -> GraphResult<Node>;

    /// Insert or replace a node of the token's branch.
    fn upsert_node(&self, token: &LockToken, node: Node) -> GraphResult<Node>;

    /// Insert an edge, or replace the edge with the same (source, target, kind).
    fn upsert_edge(&self, token: &LockToken, edge: Edge) -> GraphResult<Edge>;

    /// Delete a node together with every edge that references it.
    /// Returns the number of edges removed.
    fn delete_node(&self, token: &LockToken, session_id: &str, node_id: &str) -> GraphResult<usize>;

    fn delete_edge(&self, token: &LockToken, session_id: &str, edge_id: &str) -> GraphResult<()>;

    fn get_branch(&self, session_id: &str, branch_id: &str) -> GraphResult<Branch>;

    /// Insert or replace branch metadata (status, utility, round).
    fn put_branch(&self, branch: Branch) -> GraphResult<()>;

    fn list_branches(&self, session_id: &str) -> GraphResult<Vec<Branch>>;
}

/// Point-in-time copy of a session graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub session_id: SessionId,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub branches: Vec<Branch>,
    pub taken_at: DateTime<Utc>,
}

impl GraphSnapshot {
    pub fn goal(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_goal())
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn branch(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.id == branch_id)
    }

    pub fn branch_nodes<'a>(&'a self, branch_id: &str) -> impl Iterator<Item = &'a Node> + 'a {
        let branch_id = branch_id.to_string();
        self.nodes
            .iter()
            .filter(move |n| n.branch_id.as_deref() == Some(branch_id.as_str()))
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(move |n| n.kind() == kind)
    }

    pub fn active_branches(&self) -> impl Iterator<Item = &Branch> + '_ {
        self.branches.iter().filter(|b| b.is_active())
    }

    /// Most recent claim or synthesis of a branch (highest layer, then newest).
    pub fn latest_position(&self, branch_id: &str) -> Option<&Node> {
        self.branch_nodes(branch_id)
            .filter(|n| matches!(n.kind(), NodeKind::Claim | NodeKind::Synthesis))
            .max_by(|a, b| {
                a.layer
                    .cmp(&b.layer)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
    }

    pub fn max_layer(&self) -> u32 {
        self.nodes.iter().map(|n| n.layer).max().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct SessionGraph {
    nodes: HashMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    edges: Vec<Edge>,
    branches: Vec<Branch>,
}

impl SessionGraph {
    fn branch_of(&self, node_id: &str) -> GraphResult<Option<&str>> {
        self.nodes
            .get(node_id)
            .map(|n| n.branch_id.as_deref())
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))
    }
}

fn check_token_branch(token: &LockToken, target: Option<&str>) -> GraphResult<()> {
    match target {
        Some(branch) if branch == token.branch_id() => Ok(()),
        other => Err(GraphError::BranchMismatch {
            token_branch: token.branch_id().to_string(),
            target_branch: other.unwrap_or("<none>").to_string(),
        }),
    }
}

/// In-memory graph store keyed by session id.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    sessions: RwLock<HashMap<SessionId, SessionGraph>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedGraphStore {
        Arc::new(self)
    }
}

impl GraphStore for MemoryGraphStore {
    fn create_session(&self, session_id: &str, goal: &str) -> GraphResult<(Node, Branch)> {
        let mut sessions = self.sessions.write().map_err(|_| GraphError::LockPoisoned)?;
        if sessions.contains_key(session_id) {
            return Err(GraphError::SessionExists(session_id.to_string()));
        }

        let goal = Node::new(session_id, NodeContent::Goal { text: goal.to_string() }, 0)
            .with_confidence(1.0)
            .with_utility(1.0);
        let main = Branch::main(session_id);

        let mut graph = SessionGraph::default();
        graph.node_order.push(goal.id.clone());
        graph.nodes.insert(goal.id.clone(), goal.clone());
        graph.branches.push(main.clone());
        sessions.insert(session_id.to_string(), graph);

        debug!(session_id, goal_id = %goal.id, "Session graph created");
        Ok((goal, main))
    }

    fn snapshot(&self, session_id: &str) -> GraphResult<GraphSnapshot> {
        let sessions = self.sessions.read().map_err(|_| GraphError::LockPoisoned)?;
        let graph = sessions
            .get(session_id)
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?;

        Ok(GraphSnapshot {
            session_id: session_id.to_string(),
            nodes: graph
                .node_order
                .iter()
                .filter_map(|id| graph.nodes.get(id).cloned())
                .collect(),
            edges: graph.edges.clone(),
            branches: graph.branches.clone(),
            taken_at: Utc::now(),
        })
    }

    fn get_node(&self, session_id: &str, node_id: &str) -> GraphResult<Node> {
        let sessions = self.sessions.read().map_err(|_| GraphError::LockPoisoned)?;
        sessions
            .get(session_id)
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))
    }

    fn upsert_node(&self, token: &LockToken, node: Node) -> GraphResult<Node> {
        if node.is_goal() {
            return Err(GraphError::GoalImmutable(node.id));
        }
        check_token_branch(token, node.branch_id.as_deref())?;

        let mut sessions = self.sessions.write().map_err(|_| GraphError::LockPoisoned)?;
        let graph = sessions
            .get_mut(&node.session_id)
            .ok_or_else(|| GraphError::SessionNotFound(node.session_id.clone()))?;

        if !graph.branches.iter().any(|b| b.id == token.branch_id()) {
            return Err(GraphError::BranchNotFound(token.branch_id().to_string()));
        }
        if let Some(parent) = &node.parent_id {
            if !graph.nodes.contains_key(parent) {
                return Err(GraphError::NodeNotFound(parent.clone()));
            }
        }
        if let Some(existing) = graph.nodes.get(&node.id) {
            if existing.is_goal() {
                return Err(GraphError::GoalImmutable(node.id));
            }
            check_token_branch(token, existing.branch_id.as_deref())?;
        } else {
            graph.node_order.push(node.id.clone());
        }

        graph.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    fn upsert_edge(&self, token: &LockToken, mut edge: Edge) -> GraphResult<Edge> {
        if edge.source_id == edge.target_id {
            return Err(GraphError::SelfLoop(edge.source_id));
        }

        let mut sessions = self.sessions.write().map_err(|_| GraphError::LockPoisoned)?;
        let graph = sessions
            .get_mut(&edge.session_id)
            .ok_or_else(|| GraphError::SessionNotFound(edge.session_id.clone()))?;

        let source_branch = graph.branch_of(&edge.source_id)?;
        let target_branch = graph.branch_of(&edge.target_id)?;
        if source_branch != Some(token.branch_id()) {
            check_token_branch(token, target_branch)?;
        }

        if let Some(existing) = graph
            .edges
            .iter_mut()
            .find(|e| e.key() == edge.key())
        {
            edge.id = existing.id.clone();
            *existing = edge.clone();
        } else {
            graph.edges.push(edge.clone());
        }
        Ok(edge)
    }

    fn delete_node(&self, token: &LockToken, session_id: &str, node_id: &str) -> GraphResult<usize> {
        let mut sessions = self.sessions.write().map_err(|_| GraphError::LockPoisoned)?;
        let graph = sessions
            .get_mut(session_id)
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?;

        let node = graph
            .nodes
            .get(node_id)
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))?;
        if node.is_goal() {
            return Err(GraphError::GoalImmutable(node_id.to_string()));
        }
        check_token_branch(token, node.branch_id.as_deref())?;

        let before = graph.edges.len();
        graph.edges.retain(|e| !e.touches(node_id));
        let removed = before - graph.edges.len();

        graph.nodes.remove(node_id);
        graph.node_order.retain(|id| id != node_id);
        for child in graph.nodes.values_mut() {
            if child.parent_id.as_deref() == Some(node_id) {
                child.parent_id = None;
            }
        }

        debug!(session_id, node_id, edges_removed = removed, "Node deleted");
        Ok(removed)
    }

    fn delete_edge(&self, token: &LockToken, session_id: &str, edge_id: &str) -> GraphResult<()> {
        let mut sessions = self.sessions.write().map_err(|_| GraphError::LockPoisoned)?;
        let graph = sessions
            .get_mut(session_id)
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?;

        let position = graph
            .edges
            .iter()
            .position(|e| e.id == edge_id)
            .ok_or_else(|| GraphError::EdgeNotFound(edge_id.to_string()))?;

        let edge = &graph.edges[position];
        let source_branch = graph.branch_of(&edge.source_id)?;
        if source_branch != Some(token.branch_id()) {
            check_token_branch(token, graph.branch_of(&edge.target_id)?)?;
        }

        graph.edges.remove(position);
        Ok(())
    }

    fn get_branch(&self, session_id: &str, branch_id: &str) -> GraphResult<Branch> {
        let sessions = self.sessions.read().map_err(|_| GraphError::LockPoisoned)?;
        sessions
            .get(session_id)
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?
            .branches
            .iter()
            .find(|b| b.id == branch_id)
            .cloned()
            .ok_or_else(|| GraphError::BranchNotFound(branch_id.to_string()))
    }

    fn put_branch(&self, branch: Branch) -> GraphResult<()> {
        let mut sessions = self.sessions.write().map_err(|_| GraphError::LockPoisoned)?;
        let graph = sessions
            .get_mut(&branch.session_id)
            .ok_or_else(|| GraphError::SessionNotFound(branch.session_id.clone()))?;

        if let Some(existing) = graph.branches.iter_mut().find(|b| b.id == branch.id) {
            *existing = branch;
        } else {
            graph.branches.push(branch);
        }
        Ok(())
    }

    fn list_branches(&self, session_id: &str) -> GraphResult<Vec<Branch>> {
        let sessions = self.sessions.read().map_err(|_| GraphError::LockPoisoned)?;
        Ok(sessions
            .get(session_id)
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?
            .branches
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{HolderKind, LockToken};

    fn setup() -> (MemoryGraphStore, Node, Branch) {
        let store = MemoryGraphStore::new();
        let (goal, main) = store.create_session("s1", "Reduce latency").unwrap();
        (store, goal, main)
    }

    fn token(branch: &Branch) -> LockToken {
        LockToken::issue(&branch.id, "agent-1", HolderKind::Agent)
    }

    #[test]
    fn test_create_session_has_single_goal() {
        let (store, goal, _) = setup();
        let snap = store.snapshot("s1").unwrap();
        assert_eq!(snap.nodes_of_kind(NodeKind::Goal).count(), 1);
        assert_eq!(snap.goal().unwrap().id, goal.id);
        assert_eq!(goal.layer, 0);
        assert!(goal.parent_id.is_none());
        assert!(matches!(
            store.create_session("s1", "again"),
            Err(GraphError::SessionExists(_))
        ));
    }

    #[test]
    fn test_upsert_requires_matching_branch_token() {
        let (store, goal, main) = setup();
        let other = main.fork("alt", &goal.id);
        store.put_branch(other.clone()).unwrap();

        let node = Node::new("s1", NodeContent::claim("cache hot paths"), 1)
            .with_branch(&main.id)
            .with_parent(&goal.id);

        let err = store.upsert_node(&token(&other), node.clone()).unwrap_err();
        assert!(matches!(err, GraphError::BranchMismatch { .. }));

        store.upsert_node(&token(&main), node).unwrap();
        assert_eq!(store.snapshot("s1").unwrap().nodes.len(), 2);
    }

    #[test]
    fn test_goal_cannot_be_overwritten() {
        let (store, goal, main) = setup();
        let mut forged = goal.clone();
        forged.branch_id = Some(main.id.clone());
        assert!(matches!(
            store.upsert_node(&token(&main), forged),
            Err(GraphError::GoalImmutable(_))
        ));
    }

    #[test]
    fn test_missing_parent_is_not_found() {
        let (store, _, main) = setup();
        let node = Node::new("s1", NodeContent::claim("x"), 1)
            .with_branch(&main.id)
            .with_parent("missing");
        assert!(matches!(
            store.upsert_node(&token(&main), node),
            Err(GraphError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_edge_uniqueness_replaces_existing() {
        let (store, goal, main) = setup();
        let claim = store
            .upsert_node(
                &token(&main),
                Node::new("s1", NodeContent::claim("x"), 1).with_branch(&main.id),
            )
            .unwrap();

        let first = store
            .upsert_edge(
                &token(&main),
                Edge::new("s1", &goal.id, &claim.id, EdgeKind::Decompose).unwrap(),
            )
            .unwrap();
        let second = store
            .upsert_edge(
                &token(&main),
                Edge::new("s1", &goal.id, &claim.id, EdgeKind::Decompose)
                    .unwrap()
                    .with_weight(0.3),
            )
            .unwrap();

        let snap = store.snapshot("s1").unwrap();
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(first.id, second.id);
        assert!((snap.edges[0].weight - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delete_node_removes_edges_atomically() {
        let (store, goal, main) = setup();
        let t = token(&main);
        let a = store
            .upsert_node(&t, Node::new("s1", NodeContent::claim("a"), 1).with_branch(&main.id))
            .unwrap();
        let b = store
            .upsert_node(&t, Node::new("s1", NodeContent::claim("b"), 1).with_branch(&main.id))
            .unwrap();
        store
            .upsert_edge(&t, Edge::new("s1", &goal.id, &a.id, EdgeKind::Decompose).unwrap())
            .unwrap();
        store
            .upsert_edge(&t, Edge::new("s1", &b.id, &a.id, EdgeKind::Attack).unwrap())
            .unwrap();

        let removed = store.delete_node(&t, "s1", &a.id).unwrap();
        assert_eq!(removed, 2);

        let snap = store.snapshot("s1").unwrap();
        assert!(snap.node(&a.id).is_none());
        assert!(snap.edges.is_empty());
    }

    #[test]
    fn test_latest_position_prefers_highest_layer() {
        let (store, _, main) = setup();
        let t = token(&main);
        store
            .upsert_node(&t, Node::new("s1", NodeContent::claim("first"), 1).with_branch(&main.id))
            .unwrap();
        store
            .upsert_node(&t, Node::new("s1", NodeContent::claim("second"), 2).with_branch(&main.id))
            .unwrap();

        let snap = store.snapshot("s1").unwrap();
        assert_eq!(snap.latest_position(&main.id).unwrap().text(), "second");
        assert_eq!(snap.max_layer(), 2);
    }

    #[test]
    fn test_branch_queries_outlive_the_key() {
        let (store, _, main) = setup();
        store
            .upsert_node(&token(&main), Node::new("s1", NodeContent::claim("only"), 1).with_branch(&main.id))
            .unwrap();
        let snap = store.snapshot("s1").unwrap();

        // Results borrow the snapshot, not the temporary id.
        let latest = snap.latest_position(&main.id.clone());
        let on_main: Vec<&Node> = snap.branch_nodes(&format!("{}", main.id)).collect();
        assert_eq!(latest.map(|n| n.text()), Some("only"));
        assert_eq!(on_main.len(), 1);
    }
}
