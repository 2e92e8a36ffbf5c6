//! Engine-wide error taxonomy.
//!
//! Each module owns its own error enum. `EngineError` is the coarse
//! classification callers match on when deciding whether to retry, skip
//! a branch, or surface the failure.

use thiserror::Error;

use crate::agents::AgentError;
use crate::graph::GraphError;
use crate::lock::LockError;
use crate::oracle::OracleError;
use crate::orchestrator::OrchestratorError;
use crate::store::StoreError;

/// Coarse error classes shared across the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lock already held. Expected and non-fatal; retry or pick another branch.
    #[error("branch {branch_id} is locked by {holder_id}")]
    Contention { branch_id: String, holder_id: String },

    /// Referenced node, edge or branch is absent.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// No generation capability. Callers fall back to heuristics.
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// Allocation exceeded the budget before renormalisation.
    #[error("allocation {total:.4} exceeds budget {budget:.4}")]
    BudgetExceeded { total: f64, budget: f64 },

    /// Cycle found in a structure that must be acyclic.
    #[error("structural ambiguity: cycle through {0:?}")]
    StructuralAmbiguity(Vec<String>),

    /// Coordination store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Anything else (invalid transition, malformed input).
    #[error("{0}")]
    Other(String),
}

/// Result type for engine-level operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Whether the caller should retry later or move to another branch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contention {
                branch_id,
                holder_id,
            } => Self::Contention {
                branch_id,
                holder_id,
            },
            LockError::Store(e) => Self::Store(e.to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::NodeNotFound(id) => Self::NotFound { kind: "node", id },
            GraphError::EdgeNotFound(id) => Self::NotFound { kind: "edge", id },
            GraphError::BranchNotFound(id) => Self::NotFound { kind: "branch", id },
            GraphError::SessionNotFound(id) => Self::NotFound { kind: "session", id },
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<OracleError> for EngineError {
    fn from(err: OracleError) -> Self {
        Self::OracleUnavailable(err.to_string())
    }
}

impl From<AgentError> for EngineError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Oracle(e) => Self::OracleUnavailable(e.to_string()),
            AgentError::Graph(e) => e.into(),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for EngineError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Graph(e) => e.into(),
            OrchestratorError::Lock(e) => e.into(),
            OrchestratorError::Agent(e) => e.into(),
            OrchestratorError::NotStarted(id) => Self::NotFound { kind: "session", id },
            other => Self::Other(other.to_string()),
        }
    }
}
