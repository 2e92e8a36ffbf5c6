//! Game arbiter: per-round resource allocation and the synthesis decision.
//!
//! ```text
//!          run_round
//!   Idle ───────────▶ Scoring ──(no trigger)──▶ Debating ────┐
//!    ▲                   │                                   │
//!    │                   └──(trigger)──▶ Synthesizing ───────┤
//!    └───────────────────────────────────────────────────────┘
//! ```
//!
//! Scoring computes the Pareto front over (utility ↑, confidence ↑,
//! risk ↓) and a capped proportional allocation. The stopping decision
//! comes from the [`ConvergenceSession`](crate::convergence::ConvergenceSession)
//! when one is supplied, otherwise from simple spread/count heuristics.

pub mod game;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::convergence::ConvergenceTrigger;
use crate::graph::BranchId;
use crate::pareto::Candidate;

pub use game::GameArbiter;

/// Round-loop phase of the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterPhase {
    Idle,
    Scoring,
    Debating,
    Synthesizing,
}

impl ArbiterPhase {
    pub fn valid_transitions(self) -> &'static [ArbiterPhase] {
        match self {
            Self::Idle => &[Self::Scoring],
            Self::Scoring => &[Self::Debating, Self::Synthesizing],
            Self::Debating | Self::Synthesizing => &[Self::Idle],
        }
    }
}

impl std::fmt::Display for ArbiterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scoring => write!(f, "scoring"),
            Self::Debating => write!(f, "debating"),
            Self::Synthesizing => write!(f, "synthesizing"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error("invalid arbiter transition {from} → {to}")]
    InvalidTransition { from: ArbiterPhase, to: ArbiterPhase },
}

pub type ArbiterResult<T> = Result<T, ArbiterError>;

/// Point-in-time scores of one branch, read before any decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    pub id: BranchId,
    pub name: String,
    pub utility: f64,
    pub confidence: f64,
    pub risk: f64,
    pub main_claim: String,
}

impl BranchSnapshot {
    pub fn new(id: &str, utility: f64) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            utility,
            confidence: 0.5,
            risk: 0.5,
            main_claim: String::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_risk(mut self, risk: f64) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_claim(mut self, claim: &str) -> Self {
        self.main_claim = claim.to_string();
        self
    }

    pub fn to_candidate(&self) -> Candidate {
        Candidate::new(&self.id)
            .with("utility", self.utility)
            .with("confidence", self.confidence)
            .with("risk", self.risk)
    }
}

/// Output of the best-response iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NashEquilibrium {
    pub strategies: BTreeMap<BranchId, f64>,
    pub stable: Vec<BranchId>,
    pub eliminated: Vec<BranchId>,
}

/// What the orchestrator should do after a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ArbiterDecision {
    ContinueDebate,
    Synthesize { trigger: ConvergenceTrigger },
}

impl ArbiterDecision {
    pub fn trigger(&self) -> Option<&ConvergenceTrigger> {
        match self {
            Self::ContinueDebate => None,
            Self::Synthesize { trigger } => Some(trigger),
        }
    }
}

/// Input to one arbitration round.
#[derive(Debug, Clone, Default)]
pub struct RoundInput {
    pub branches: Vec<BranchSnapshot>,
    /// `conflict[i][j]`: payoff to branch i against branch j
    pub conflict_matrix: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round: u32,
    pub front: Vec<BranchId>,
    pub allocation: BTreeMap<BranchId, f64>,
    pub nash: Option<NashEquilibrium>,
    pub decision: ArbiterDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterStatus {
    pub round: u32,
    pub phase: ArbiterPhase,
    pub pareto_front_size: usize,
    pub resource_budget: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_cycle() {
        assert_eq!(ArbiterPhase::Idle.valid_transitions(), &[ArbiterPhase::Scoring]);
        assert!(ArbiterPhase::Scoring
            .valid_transitions()
            .contains(&ArbiterPhase::Synthesizing));
        assert!(!ArbiterPhase::Debating
            .valid_transitions()
            .contains(&ArbiterPhase::Scoring));
    }

    #[test]
    fn test_snapshot_candidate() {
        let c = BranchSnapshot::new("b1", 0.7).with_risk(0.2).to_candidate();
        assert_eq!(c.value("utility"), 0.7);
        assert_eq!(c.value("risk"), 0.2);
        assert_eq!(c.value("confidence"), 0.5);
    }
}
