//! Event types emitted by the engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentRole;
use crate::convergence::ConvergenceTrigger;
use crate::graph::{BranchId, EdgeKind, LockState, NodeId, NodeKind, SessionId};
use crate::lock::HolderKind;
use crate::orchestrator::Phase;

/// Per-session, monotonically increasing event id.
pub type EventId = u64;

/// Every state transition the engine reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Lock acquired, released or overridden on a branch
    LockChanged {
        branch_id: BranchId,
        state: LockState,
        holder_id: Option<String>,
        holder_kind: Option<HolderKind>,
        timestamp: DateTime<Utc>,
    },

    /// Operator paused every branch of the session
    GlobalInterrupt {
        user_id: String,
        branches_paused: usize,
        timestamp: DateTime<Utc>,
    },

    /// Pipeline phase changed
    PhaseChanged {
        from: Phase,
        to: Phase,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Coarse progress inside a phase (0.0 - 1.0)
    ProgressUpdated {
        phase: Phase,
        progress: f64,
        message: String,
        timestamp: DateTime<Utc>,
    },

    NodeCreated {
        node_id: NodeId,
        branch_id: Option<BranchId>,
        kind: NodeKind,
        layer: u32,
        timestamp: DateTime<Utc>,
    },

    EdgeCreated {
        edge_id: String,
        source_id: NodeId,
        target_id: NodeId,
        kind: EdgeKind,
        timestamp: DateTime<Utc>,
    },

    BranchForked {
        branch_id: BranchId,
        parent_branch_id: BranchId,
        at_node_id: NodeId,
        timestamp: DateTime<Utc>,
    },

    BranchPruned {
        branch_id: BranchId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    BranchMerged {
        branch_id: BranchId,
        into_branch_id: BranchId,
        timestamp: DateTime<Utc>,
    },

    /// Arbiter allocation snapshot for one round
    AllocationComputed {
        round: u32,
        front: Vec<BranchId>,
        allocation: BTreeMap<BranchId, f64>,
        timestamp: DateTime<Utc>,
    },

    /// Debate must stop
    ConvergenceTriggered {
        round: u32,
        trigger: ConvergenceTrigger,
        timestamp: DateTime<Utc>,
    },

    AuditCompleted {
        compliant: bool,
        violations: usize,
        cycles: usize,
        timestamp: DateTime<Utc>,
    },

    AgentStarted {
        agent: AgentRole,
        branch_id: Option<BranchId>,
        timestamp: DateTime<Utc>,
    },

    AgentCompleted {
        agent: AgentRole,
        branch_id: Option<BranchId>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::LockChanged { timestamp, .. }
            | Self::GlobalInterrupt { timestamp, .. }
            | Self::PhaseChanged { timestamp, .. }
            | Self::ProgressUpdated { timestamp, .. }
            | Self::NodeCreated { timestamp, .. }
            | Self::EdgeCreated { timestamp, .. }
            | Self::BranchForked { timestamp, .. }
            | Self::BranchPruned { timestamp, .. }
            | Self::BranchMerged { timestamp, .. }
            | Self::AllocationComputed { timestamp, .. }
            | Self::ConvergenceTriggered { timestamp, .. }
            | Self::AuditCompleted { timestamp, .. }
            | Self::AgentStarted { timestamp, .. }
            | Self::AgentCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LockChanged { .. } => "lock_changed",
            Self::GlobalInterrupt { .. } => "global_interrupt",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::ProgressUpdated { .. } => "progress_updated",
            Self::NodeCreated { .. } => "node_created",
            Self::EdgeCreated { .. } => "edge_created",
            Self::BranchForked { .. } => "branch_forked",
            Self::BranchPruned { .. } => "branch_pruned",
            Self::BranchMerged { .. } => "branch_merged",
            Self::AllocationComputed { .. } => "allocation_computed",
            Self::ConvergenceTriggered { .. } => "convergence_triggered",
            Self::AuditCompleted { .. } => "audit_completed",
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentCompleted { .. } => "agent_completed",
        }
    }

    /// Branch this event concerns, if any
    pub fn branch_id(&self) -> Option<&str> {
        match self {
            Self::LockChanged { branch_id, .. }
            | Self::BranchForked { branch_id, .. }
            | Self::BranchPruned { branch_id, .. }
            | Self::BranchMerged { branch_id, .. } => Some(branch_id),
            Self::NodeCreated { branch_id, .. }
            | Self::AgentStarted { branch_id, .. }
            | Self::AgentCompleted { branch_id, .. } => branch_id.as_deref(),
            _ => None,
        }
    }
}

/// An event stamped with its session and sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub event: EngineEvent,
}

impl EventEnvelope {
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Server-sent-events frame, with the id a client resumes from.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(&self.event).unwrap_or_else(|_| "{}".to_string());
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.id, self.event_type(), data)
    }
}
