//! Reasoning graph model and the in-memory graph store.
//!
//! Nodes carry typed content (`NodeContent`) plus an open metadata
//! side-table. Edges are vertical (Decompose, Derive) or horizontal
//! (Support, Attack, Conflict, Entail). Branches partition the nodes of a
//! session into independent lineages, each writable by one lock holder.
//!
//! ```text
//!                 ┌──────────┐
//!                 │   Goal   │ layer 0
//!                 └────┬─────┘
//!          decompose   │   decompose
//!        ┌─────────────┼─────────────┐
//!        ▼             ▼             ▼
//!   ┌─────────┐   ┌─────────┐   ┌─────────┐
//!   │ Claim A │◀─▶│ Claim B │   │ Claim C │ layer 1 (branch per claim)
//!   └─────────┘   └─────────┘   └─────────┘
//!         attack / support (horizontal)
//! ```
//!
//! Writes go through [`GraphStore`] and require a [`LockToken`] for the
//! branch being written.
//!
//! [`LockToken`]: crate::lock::LockToken

pub mod store;
pub mod types;

pub use store::{GraphSnapshot, GraphStore, MemoryGraphStore, SharedGraphStore};
pub use types::{
    Branch, BranchId, BranchStatus, Edge, EdgeId, EdgeKind, ForkPoint, LockState, Metadata,
    Node, NodeContent, NodeId, NodeKind, SessionId,
};

/// Error type for graph operations
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Self-loop on node {0}")]
    SelfLoop(String),

    #[error("Goal node {0} cannot be written or deleted")]
    GoalImmutable(String),

    #[error("Lock token for branch {token_branch} cannot write branch {target_branch}")]
    BranchMismatch {
        token_branch: String,
        target_branch: String,
    },

    #[error("Branch {branch_id}: invalid transition {from} → {to}")]
    InvalidTransition {
        branch_id: String,
        from: BranchStatus,
        to: BranchStatus,
    },

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;
