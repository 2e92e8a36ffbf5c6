//! Phase orchestrator: the top-level pipeline state machine.
//!
//! ```text
//!  Idle ─▶ Divergence ─▶ Filtering ─▶ Convergence ─▶ Compilation ─▶ Completed
//!   │          │             │             │               │
//!   └──────────┴─────────────┴──────┬──────┴───────────────┘
//!                                   ▼
//!                                Aborted   (global interrupt or fatal error)
//! ```
//!
//! Divergence forks one branch per generated candidate. Filtering audits
//! the graph and prunes branches off the Pareto front. Convergence runs
//! concurrent per-branch debate rounds under branch locks until the
//! arbiter fires a trigger, then synthesizes. Compilation renders the
//! final output.

pub mod pipeline;
pub mod session;

use serde::{Deserialize, Serialize};

use crate::agents::AgentError;
use crate::analysis::AnalysisError;
use crate::arbiter::ArbiterError;
use crate::graph::{BranchId, GraphError};
use crate::lock::LockError;

pub use pipeline::{CompiledOutput, AuditSummary, PhaseOrchestrator, PipelineOutcome, SessionRequest};
pub use session::{PhaseTransition, PipelineSession, PipelineState};

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Divergence,
    Filtering,
    Convergence,
    Compilation,
    Completed,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn valid_transitions(self) -> &'static [Phase] {
        match self {
            Self::Idle => &[Self::Divergence, Self::Aborted],
            Self::Divergence => &[Self::Filtering, Self::Aborted],
            Self::Filtering => &[Self::Convergence, Self::Aborted],
            Self::Convergence => &[Self::Compilation, Self::Aborted],
            Self::Compilation => &[Self::Completed, Self::Aborted],
            Self::Completed | Self::Aborted => &[],
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Divergence => write!(f, "divergence"),
            Self::Filtering => write!(f, "filtering"),
            Self::Convergence => write!(f, "convergence"),
            Self::Compilation => write!(f, "compilation"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Error type for pipeline runs
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid phase transition {from} → {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Session {session_id} interrupted during {phase}")]
    Interrupted { session_id: String, phase: Phase },

    #[error("Session {0} has not been started")]
    NotStarted(String),

    #[error("Branch {branch_id} is not editable by {user_id}")]
    NotEditable { branch_id: BranchId, user_id: String },

    #[error("Lock on branch {0} was lost before writing")]
    LockLost(BranchId),

    #[error("No branch left to converge")]
    NoBranches,

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Arbiter error: {0}")]
    Arbiter(#[from] ArbiterError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),
}

impl OrchestratorError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Another holder has the branch, or had it by the time we wrote.
    /// Never fatal to a session: the caller skips or picks another branch.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Lock(e) => e.is_contention(),
            Self::LockLost(_) => true,
            _ => false,
        }
    }
}

/// Result type for pipeline runs
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
