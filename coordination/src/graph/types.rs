//! Graph model: nodes, edges and branches of a reasoning session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{GraphError, GraphResult};

pub type SessionId = String;
pub type NodeId = String;
pub type EdgeId = String;
pub type BranchId = String;

/// Open key/value side-table for per-node extension data.
pub type Metadata = BTreeMap<String, serde_json::Value>;

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Node type, derived from the content variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Goal,
    Claim,
    Fact,
    Constraint,
    AtomicTopic,
    Pending,
    Synthesis,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Goal => write!(f, "goal"),
            Self::Claim => write!(f, "claim"),
            Self::Fact => write!(f, "fact"),
            Self::Constraint => write!(f, "constraint"),
            Self::AtomicTopic => write!(f, "atomic_topic"),
            Self::Pending => write!(f, "pending"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Typed node payload. Each variant carries the fields its kind requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeContent {
    Goal {
        text: String,
    },
    Claim {
        text: String,
        #[serde(default)]
        evidence: Vec<String>,
    },
    Fact {
        text: String,
        #[serde(default)]
        source: Option<String>,
    },
    Constraint {
        text: String,
        /// Hard constraints make a violating session non-compliant.
        hard: bool,
    },
    AtomicTopic {
        text: String,
    },
    Pending {
        text: String,
    },
    Synthesis {
        text: String,
        source_branches: Vec<BranchId>,
    },
}

impl NodeContent {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Goal { .. } => NodeKind::Goal,
            Self::Claim { .. } => NodeKind::Claim,
            Self::Fact { .. } => NodeKind::Fact,
            Self::Constraint { .. } => NodeKind::Constraint,
            Self::AtomicTopic { .. } => NodeKind::AtomicTopic,
            Self::Pending { .. } => NodeKind::Pending,
            Self::Synthesis { .. } => NodeKind::Synthesis,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Goal { text }
            | Self::Claim { text, .. }
            | Self::Fact { text, .. }
            | Self::Constraint { text, .. }
            | Self::AtomicTopic { text }
            | Self::Pending { text }
            | Self::Synthesis { text, .. } => text,
        }
    }

    pub fn claim(text: impl Into<String>) -> Self {
        Self::Claim {
            text: text.into(),
            evidence: Vec::new(),
        }
    }
}

/// A node in the reasoning graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub session_id: SessionId,
    pub content: NodeContent,
    pub layer: u32,
    pub branch_id: Option<BranchId>,
    pub parent_id: Option<NodeId>,
    pub confidence: f64,
    pub utility: f64,
    pub sensitivity: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Create a node with neutral scores (confidence 0.5, utility 0.5).
    pub fn new(session_id: &str, content: NodeContent, layer: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            content,
            layer,
            branch_id: None,
            parent_id: None,
            confidence: 0.5,
            utility: 0.5,
            sensitivity: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_branch(mut self, branch_id: &str) -> Self {
        self.branch_id = Some(branch_id.to_string());
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }

    pub fn with_utility(mut self, utility: f64) -> Self {
        self.utility = clamp_unit(utility);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.content.kind()
    }

    pub fn text(&self) -> &str {
        self.content.text()
    }

    pub fn is_goal(&self) -> bool {
        self.kind() == NodeKind::Goal
    }

    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_unit(confidence);
    }

    pub fn set_utility(&mut self, utility: f64) {
        self.utility = clamp_unit(utility);
    }

    pub fn set_sensitivity(&mut self, sensitivity: f64) {
        self.sensitivity = Some(clamp_unit(sensitivity));
    }

    /// Numeric metadata lookup (e.g. `risk`), if present.
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(|v| v.as_f64())
    }
}

/// Edge type. Decompose and Derive are vertical, the rest horizontal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Decompose,
    Derive,
    Support,
    Attack,
    Conflict,
    Entail,
}

impl EdgeKind {
    /// Cross-layer structural edge.
    pub fn is_vertical(self) -> bool {
        matches!(self, Self::Decompose | Self::Derive)
    }

    /// Same-layer argumentative edge.
    pub fn is_horizontal(self) -> bool {
        !self.is_vertical()
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decompose => write!(f, "decompose"),
            Self::Derive => write!(f, "derive"),
            Self::Support => write!(f, "support"),
            Self::Attack => write!(f, "attack"),
            Self::Conflict => write!(f, "conflict"),
            Self::Entail => write!(f, "entail"),
        }
    }
}

/// A directed edge between two nodes of the same session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub session_id: SessionId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub kind: EdgeKind,
    pub weight: f64,
    pub validated: Option<bool>,
}

impl Edge {
    /// Create an edge with weight 1.0. Self-loops are rejected.
    pub fn new(session_id: &str, source_id: &str, target_id: &str, kind: EdgeKind) -> GraphResult<Self> {
        if source_id == target_id {
            return Err(GraphError::SelfLoop(source_id.to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            kind,
            weight: 1.0,
            validated: None,
        })
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = clamp_unit(weight);
        self
    }

    /// Uniqueness key within a session.
    pub fn key(&self) -> (&str, &str, EdgeKind) {
        (&self.source_id, &self.target_id, self.kind)
    }

    pub fn touches(&self, node_id: &str) -> bool {
        self.source_id == node_id || self.target_id == node_id
    }
}

/// Lifecycle status of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Paused,
    Completed,
    Pruned,
    Merged,
}

impl BranchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Pruned | Self::Merged)
    }

    pub fn valid_transitions(self) -> &'static [BranchStatus] {
        match self {
            Self::Active => &[Self::Paused, Self::Completed, Self::Pruned, Self::Merged],
            Self::Paused => &[Self::Active, Self::Pruned],
            Self::Completed | Self::Pruned | Self::Merged => &[],
        }
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Pruned => write!(f, "pruned"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// Who may write a branch right now, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// No agent holds the branch; the user may edit.
    Editable,
    /// An agent is writing; the user observes.
    Observation,
    /// Session-wide pause by the operator.
    Paused,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Editable => write!(f, "editable"),
            Self::Observation => write!(f, "observation"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Where a branch was forked from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkPoint {
    pub branch_id: BranchId,
    pub node_id: NodeId,
}

/// An independent reasoning lineage within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub session_id: SessionId,
    pub name: String,
    pub status: BranchStatus,
    pub utility_score: f64,
    pub lock_state: LockState,
    pub lock_holder_id: Option<String>,
    pub debate_round: u32,
    pub forked_from: Option<ForkPoint>,
    pub merged_into: Option<BranchId>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// The session's main branch.
    pub fn main(session_id: &str) -> Self {
        Self::new(session_id, "main")
    }

    pub fn new(session_id: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            name: name.to_string(),
            status: BranchStatus::Active,
            utility_score: 0.0,
            lock_state: LockState::Editable,
            lock_holder_id: None,
            debate_round: 0,
            forked_from: None,
            merged_into: None,
            created_at: Utc::now(),
        }
    }

    /// Fork a new active branch from this one at `node_id`.
    pub fn fork(&self, name: &str, node_id: &str) -> Self {
        let mut branch = Self::new(&self.session_id, name);
        branch.forked_from = Some(ForkPoint {
            branch_id: self.id.clone(),
            node_id: node_id.to_string(),
        });
        branch
    }

    pub fn is_active(&self) -> bool {
        self.status == BranchStatus::Active
    }

    pub fn set_utility(&mut self, utility: f64) {
        self.utility_score = clamp_unit(utility);
    }

    /// Move to a new lifecycle status.
    pub fn transition(&mut self, to: BranchStatus) -> GraphResult<()> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(GraphError::InvalidTransition {
                branch_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Fold this branch into `target` after synthesis.
    pub fn merge_into(&mut self, target: &str) -> GraphResult<()> {
        self.transition(BranchStatus::Merged)?;
        self.merged_into = Some(target.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_rejects_self_loop() {
        let err = Edge::new("s1", "n1", "n1", EdgeKind::Support).unwrap_err();
        assert!(matches!(err, GraphError::SelfLoop(_)));
    }

    #[test]
    fn test_edge_direction_classification() {
        assert!(EdgeKind::Decompose.is_vertical());
        assert!(EdgeKind::Derive.is_vertical());
        for kind in [EdgeKind::Support, EdgeKind::Attack, EdgeKind::Conflict, EdgeKind::Entail] {
            assert!(kind.is_horizontal(), "{kind} should be horizontal");
        }
    }

    #[test]
    fn test_node_scores_are_clamped() {
        let node = Node::new("s1", NodeContent::claim("x"), 1)
            .with_confidence(1.7)
            .with_utility(-0.3);
        assert_eq!(node.confidence, 1.0);
        assert_eq!(node.utility, 0.0);
    }

    #[test]
    fn test_node_content_tagging() {
        let node = Node::new(
            "s1",
            NodeContent::Constraint {
                text: "must be cheap".into(),
                hard: true,
            },
            1,
        );
        assert_eq!(node.kind(), NodeKind::Constraint);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["content"]["kind"], "constraint");
        assert_eq!(json["content"]["hard"], true);
    }

    #[test]
    fn test_branch_lifecycle() {
        let main = Branch::main("s1");
        let mut fork = main.fork("alt", "goal");
        assert_eq!(fork.forked_from.as_ref().unwrap().branch_id, main.id);

        fork.merge_into(&main.id).unwrap();
        assert_eq!(fork.status, BranchStatus::Merged);
        assert!(fork.transition(BranchStatus::Active).is_err());
    }

    #[test]
    fn test_paused_branch_cannot_merge() {
        let mut branch = Branch::main("s1");
        branch.transition(BranchStatus::Paused).unwrap();
        assert!(branch.transition(BranchStatus::Merged).is_err());
        branch.transition(BranchStatus::Active).unwrap();
        assert!(branch.is_active());
    }
}
