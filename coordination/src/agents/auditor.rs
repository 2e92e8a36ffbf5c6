//! Consistency, constraint and structure audit of a session graph.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AgentResult, AgentRole};
use crate::analysis::{ReasoningGraph, SensitivityAnalyzer, SensitivityReport};
use crate::config::SensitivityConfig;
use crate::error::EngineError;
use crate::graph::{BranchStatus, GraphSnapshot, Node, NodeContent, NodeId, NodeKind};
use crate::oracle::SharedOracle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub first: NodeId,
    pub second: NodeId,
}

/// One constraint checked against every live claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintCheck {
    pub constraint_id: NodeId,
    pub text: String,
    pub hard: bool,
    pub violations: Vec<NodeId>,
}

impl ConstraintCheck {
    pub fn is_satisfied(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub contradictions: Vec<Contradiction>,
    pub constraints: Vec<ConstraintCheck>,
    /// Cycles in the structural graph
    pub cycles: Vec<Vec<NodeId>>,
    pub is_compliant: bool,
    pub sensitivity: Option<SensitivityReport>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.contradictions.is_empty()
    }

    /// The first cycle as an error, for callers that need an acyclic graph.
    pub fn structural_ambiguity(&self) -> Option<EngineError> {
        self.cycles
            .first()
            .map(|cycle| EngineError::StructuralAmbiguity(cycle.clone()))
    }

    pub fn hard_violations(&self) -> impl Iterator<Item = &ConstraintCheck> {
        self.constraints.iter().filter(|c| c.hard && !c.is_satisfied())
    }

    pub fn soft_violations(&self) -> impl Iterator<Item = &ConstraintCheck> {
        self.constraints.iter().filter(|c| !c.hard && !c.is_satisfied())
    }

    /// Claims that break a hard constraint.
    pub fn violating_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .hard_violations()
            .flat_map(|c| c.violations.iter().cloned())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

#[async_trait]
pub trait Auditor: Send + Sync {
    fn role(&self) -> AgentRole {
        AgentRole::Auditor
    }

    async fn audit(&self, snapshot: &GraphSnapshot) -> AgentResult<AuditReport>;
}

pub struct OracleAuditor {
    oracle: SharedOracle,
    sensitivity: SensitivityConfig,
}

impl OracleAuditor {
    pub fn new(oracle: SharedOracle, sensitivity: SensitivityConfig) -> Self {
        Self { oracle, sensitivity }
    }

    /// Claims and syntheses on branches that are still in play.
    fn live_claims(snapshot: &GraphSnapshot) -> Vec<&Node> {
        snapshot
            .nodes
            .iter()
            .filter(|n| matches!(n.kind(), NodeKind::Claim | NodeKind::Synthesis))
            .filter(|n| {
                n.branch_id
                    .as_deref()
                    .and_then(|b| snapshot.branch(b))
                    .map_or(true, |b| {
                        !matches!(b.status, BranchStatus::Pruned | BranchStatus::Merged)
                    })
            })
            .collect()
    }

    async fn check_consistency(&self, claims: &[&Node]) -> Vec<Contradiction> {
        let mut contradictions = Vec::new();
        for (i, a) in claims.iter().enumerate() {
            for b in &claims[i + 1..] {
                if self.oracle.contradicts(a.text(), b.text()).await {
                    contradictions.push(Contradiction {
                        first: a.id.clone(),
                        second: b.id.clone(),
                    });
                }
            }
        }
        contradictions
    }

    async fn check_constraints(&self, snapshot: &GraphSnapshot, claims: &[&Node]) -> Vec<ConstraintCheck> {
        let mut checks = Vec::new();
        for constraint in snapshot.nodes_of_kind(NodeKind::Constraint) {
            let hard = matches!(constraint.content, NodeContent::Constraint { hard: true, .. });
            let mut violations = Vec::new();
            for claim in claims {
                if self.oracle.violates(claim.text(), constraint.text()).await {
                    violations.push(claim.id.clone());
                }
            }
            checks.push(ConstraintCheck {
                constraint_id: constraint.id.clone(),
                text: constraint.text().to_string(),
                hard,
                violations,
            });
        }
        checks
    }
}

#[async_trait]
impl Auditor for OracleAuditor {
    async fn audit(&self, snapshot: &GraphSnapshot) -> AgentResult<AuditReport> {
        let claims = Self::live_claims(snapshot);
        let contradictions = self.check_consistency(&claims).await;
        let constraints = self.check_constraints(snapshot, &claims).await;

        let graph = ReasoningGraph::from_snapshot(snapshot)?;
        let analyzer = SensitivityAnalyzer::new(graph, self.sensitivity.clone());
        let sensitivity = analyzer.analyze();
        let cycles = sensitivity.cycles.clone();

        let hard_violation = constraints.iter().any(|c| c.hard && !c.is_satisfied());
        let is_compliant = contradictions.is_empty() && !hard_violation && cycles.is_empty();

        info!(
            session_id = %snapshot.session_id,
            claims = claims.len(),
            contradictions = contradictions.len(),
            compliant = is_compliant,
            "Audit complete"
        );

        let report = AuditReport {
            contradictions,
            constraints,
            cycles,
            is_compliant,
            sensitivity: Some(sensitivity),
        };
        if let Some(err) = report.structural_ambiguity() {
            warn!(session_id = %snapshot.session_id, cycles = report.cycles.len(), error = %err, "Session flagged non-compliant");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeKind, GraphStore, MemoryGraphStore};
    use crate::lock::{HolderKind, LockToken};
    use crate::oracle::NullOracle;
    use std::sync::Arc;

    fn auditor() -> OracleAuditor {
        let config = SensitivityConfig {
            samples: 50,
            seed: Some(1),
            ..SensitivityConfig::default()
        };
        OracleAuditor::new(Arc::new(NullOracle::new()), config)
    }

    #[tokio::test]
    async fn test_audit_flags_contradiction_and_hard_violation() {
        let store = MemoryGraphStore::new();
        let (goal, main) = store.create_session("s1", "pick a database").unwrap();
        let token = LockToken::issue(&main.id, "auditor-test", HolderKind::Agent);

        let constraint = Node::new(
            "s1",
            NodeContent::Constraint {
                text: "must support offline replication".into(),
                hard: true,
            },
            1,
        )
        .with_branch(&main.id);
        store.upsert_node(&token, constraint).unwrap();

        let a = store
            .upsert_node(
                &token,
                Node::new("s1", NodeContent::claim("we should use postgres for the order service"), 1)
                    .with_branch(&main.id),
            )
            .unwrap();
        let b = store
            .upsert_node(
                &token,
                Node::new("s1", NodeContent::claim("we should not use postgres for the order service"), 1)
                    .with_branch(&main.id),
            )
            .unwrap();
        for id in [&a.id, &b.id] {
            store
                .upsert_edge(&token, Edge::new("s1", &goal.id, id, EdgeKind::Decompose).unwrap())
                .unwrap();
        }

        let report = auditor().audit(&store.snapshot("s1").unwrap()).await.unwrap();
        assert_eq!(report.contradictions.len(), 1);
        assert!(!report.is_consistent());
        assert_eq!(report.hard_violations().count(), 1);
        assert_eq!(report.violating_nodes().len(), 2);
        assert!(!report.is_compliant);
        assert!(report.cycles.is_empty());
        assert!(report.structural_ambiguity().is_none());
        assert!(report.sensitivity.is_some());
    }

    #[tokio::test]
    async fn test_clean_graph_is_compliant() {
        let store = MemoryGraphStore::new();
        let (goal, main) = store.create_session("s2", "name the project").unwrap();
        let token = LockToken::issue(&main.id, "auditor-test", HolderKind::Agent);
        let claim = store
            .upsert_node(
                &token,
                Node::new("s2", NodeContent::claim("call it lighthouse"), 1).with_branch(&main.id),
            )
            .unwrap();
        store
            .upsert_edge(&token, Edge::new("s2", &goal.id, &claim.id, EdgeKind::Decompose).unwrap())
            .unwrap();

        let report = auditor().audit(&store.snapshot("s2").unwrap()).await.unwrap();
        assert!(report.is_compliant);
        assert!(report.constraints.is_empty());
    }
}
