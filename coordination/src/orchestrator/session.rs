//! Pipeline session: current phase plus its transition history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OrchestratorError, OrchestratorResult, Phase};
use crate::convergence::{ConvergenceStatus, ConvergenceTrigger};
use crate::graph::{BranchId, NodeId, SessionId};

/// A phase transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Mutable state of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSession {
    pub session_id: SessionId,
    pub goal: String,
    pub goal_id: Option<NodeId>,
    pub main_branch_id: Option<BranchId>,
    pub phase: Phase,
    pub round: u32,
    /// Coarse progress of the current phase (0.0 - 1.0)
    pub progress: f64,
    pub trigger: Option<ConvergenceTrigger>,
    pub convergence: Option<ConvergenceStatus>,
    pub transitions: Vec<PhaseTransition>,
    pub started_at: DateTime<Utc>,
}

impl PipelineSession {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            goal: String::new(),
            goal_id: None,
            main_branch_id: None,
            phase: Phase::Idle,
            round: 0,
            progress: 0.0,
            trigger: None,
            convergence: None,
            transitions: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Move to `to`, recording why.
    pub fn transition(&mut self, to: Phase, reason: &str) -> OrchestratorResult<PhaseTransition> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(OrchestratorError::InvalidTransition { from: self.phase, to });
        }
        let record = PhaseTransition {
            from: self.phase,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };
        self.transitions.push(record.clone());
        self.phase = to;
        self.progress = 0.0;
        Ok(record)
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Phases visited, starting from Idle.
    pub fn phase_history(&self) -> Vec<Phase> {
        std::iter::once(Phase::Idle)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}

/// Observability view returned by `get_current_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub session_id: SessionId,
    pub phase: Phase,
    pub progress: f64,
    pub round: u32,
    pub active_branches: usize,
    pub node_count: usize,
    pub trigger: Option<ConvergenceTrigger>,
    pub convergence: Option<ConvergenceStatus>,
    pub transitions: Vec<PhaseTransition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_history() {
        let mut s = PipelineSession::new("s1");
        s.transition(Phase::Divergence, "started").unwrap();
        s.transition(Phase::Filtering, "candidates ready").unwrap();
        assert_eq!(s.transitions.len(), 2);
        assert_eq!(s.transitions[1].from, Phase::Divergence);
        assert_eq!(
            s.phase_history(),
            vec![Phase::Idle, Phase::Divergence, Phase::Filtering]
        );
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut s = PipelineSession::new("s1");
        let err = s.transition(Phase::Compilation, "skip").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                from: Phase::Idle,
                to: Phase::Compilation
            }
        ));
        assert_eq!(s.phase, Phase::Idle);

        s.transition(Phase::Aborted, "operator").unwrap();
        assert!(s.is_complete());
        assert!(s.transition(Phase::Divergence, "again").is_err());
    }
}
