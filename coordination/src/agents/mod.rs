//! Agent seams driven by the phase orchestrator.
//!
//! ```text
//!   Divergence        Filtering           Convergence
//!  ┌───────────┐    ┌───────────┐       ┌───────────┐
//!  │ Generator │    │  Auditor  │       │  Debater  │ × branch
//!  └─────┬─────┘    └─────┬─────┘       └─────┬─────┘
//!        │ proposals      │ audit report      │ position
//!        ▼                ▼                   ▼
//!          graph writes under branch lock tokens
//! ```
//!
//! Each role is an async trait with an oracle-backed implementation.
//! The implementations never fail on an unreachable oracle: they log
//! and fall back to the offline rendering.

pub mod auditor;
pub mod debater;
pub mod generator;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisError;
use crate::config::SensitivityConfig;
use crate::graph::GraphError;
use crate::oracle::{OracleError, SharedOracle};

pub use auditor::{
    AuditReport, Auditor, ConstraintCheck, Contradiction, OracleAuditor,
};
pub use debater::{DebateRequest, Debater, OracleDebater, Position};
pub use generator::{Generator, OracleGenerator, Proposal, Strategy};

/// Which agent produced a piece of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Generator,
    Auditor,
    Debater,
    Arbiter,
    Compiler,
}

impl AgentRole {
    /// Holder type recorded on lock records.
    pub fn holder_type(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Auditor => "auditor",
            Self::Debater => "debater",
            Self::Arbiter => "arbiter",
            Self::Compiler => "compiler",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.holder_type())
    }
}

/// Error type for agent work
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Agent {0} produced no output")]
    EmptyOutput(AgentRole),
}

/// Result type for agent work
pub type AgentResult<T> = Result<T, AgentError>;

/// The three working agents of a pipeline.
#[derive(Clone)]
pub struct AgentSet {
    pub generator: Arc<dyn Generator>,
    pub auditor: Arc<dyn Auditor>,
    pub debater: Arc<dyn Debater>,
}

impl AgentSet {
    /// Oracle-backed agents sharing one oracle.
    pub fn from_oracle(oracle: SharedOracle, sensitivity: SensitivityConfig) -> Self {
        Self {
            generator: Arc::new(OracleGenerator::new(oracle.clone())),
            auditor: Arc::new(OracleAuditor::new(oracle.clone(), sensitivity)),
            debater: Arc::new(OracleDebater::new(oracle)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display_and_serde() {
        assert_eq!(AgentRole::Debater.to_string(), "debater");
        assert_eq!(
            serde_json::to_string(&AgentRole::Generator).unwrap(),
            "\"generator\""
        );
    }
}
