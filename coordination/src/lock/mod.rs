//! Branch-level lock protocol.
//!
//! Exactly one actor may write a branch at a time. A lock record lives in
//! the coordination store under `lock:branch:{id}` with a TTL; its holder
//! kind decides the observable [`LockState`].
//!
//! ```text
//!            acquire_agent_lock (SET NX EX)
//!  Editable ───────────────────────────────▶ Observation
//!     ▲                                          │
//!     │  release (compare-and-delete) / TTL      │
//!     └──────────────────────────────────────────┘
//!
//!  any state ── trigger_global_interrupt (overwrite) ──▶ Paused
//!  Paused    ── clear_global_pause ───────────────────▶ Editable
//! ```
//!
//! Locking is cooperative: acquisition hands out a [`LockToken`] that the
//! graph store's write methods require, but the graph store does not ask
//! the coordination store whether the token is still live. Callers check
//! with [`BranchLockService::verify`] before long write sequences.

pub mod service;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{BranchId, LockState};
use crate::store::StoreError;

pub use service::{BranchLockService, SharedLockService};

/// Error type for lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Expected outcome under contention; retry or pick another branch.
    #[error("Branch {branch_id} already locked by {holder_id}")]
    Contention { branch_id: String, holder_id: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed lock record: {0}")]
    Serialization(String),
}

impl LockError {
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Kind of actor holding a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderKind {
    Agent,
    User,
    GlobalPause,
}

impl HolderKind {
    /// Observable branch state while a lock of this kind is held.
    pub fn lock_state(self) -> LockState {
        match self {
            Self::Agent => LockState::Observation,
            Self::User => LockState::Editable,
            Self::GlobalPause => LockState::Paused,
        }
    }
}

impl std::fmt::Display for HolderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::User => write!(f, "user"),
            Self::GlobalPause => write!(f, "global_pause"),
        }
    }
}

/// Descriptive data about a lock holder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderMeta {
    pub name: String,
    pub agent_type: Option<String>,
}

impl HolderMeta {
    pub fn agent(name: &str, agent_type: &str) -> Self {
        Self {
            name: name.to_string(),
            agent_type: Some(agent_type.to_string()),
        }
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            agent_type: None,
        }
    }
}

/// Record stored under a branch's lock key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub branch_id: BranchId,
    pub holder_id: String,
    pub holder_kind: HolderKind,
    pub holder_name: String,
    pub holder_type: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Fresh per acquisition, so a token from an earlier lease never matches.
    #[serde(default)]
    pub nonce: String,
}

/// Capability proving the bearer acquired a branch lock.
///
/// Only [`BranchLockService`] issues tokens. Graph writes take one by
/// reference; releasing consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    branch_id: BranchId,
    holder_id: String,
    holder_kind: HolderKind,
    acquired_at: DateTime<Utc>,
    nonce: String,
}

impl LockToken {
    pub(crate) fn issue(branch_id: &str, holder_id: &str, holder_kind: HolderKind) -> Self {
        Self {
            branch_id: branch_id.to_string(),
            holder_id: holder_id.to_string(),
            holder_kind,
            acquired_at: Utc::now(),
            nonce: Uuid::new_v4().to_string(),
        }
    }

    /// Token for the lease a live record describes.
    pub(crate) fn for_record(record: &LockRecord) -> Self {
        Self {
            branch_id: record.branch_id.clone(),
            holder_id: record.holder_id.clone(),
            holder_kind: record.holder_kind,
            acquired_at: record.acquired_at,
            nonce: record.nonce.clone(),
        }
    }

    /// Whether `record` is the lease this token was issued for.
    pub fn matches(&self, record: &LockRecord) -> bool {
        record.branch_id == self.branch_id
            && record.holder_id == self.holder_id
            && record.holder_kind == self.holder_kind
            && record.nonce == self.nonce
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn holder_kind(&self) -> HolderKind {
        self.holder_kind
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

/// Read-only view of a branch's lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStatus {
    pub branch_id: BranchId,
    pub state: LockState,
    pub holder_id: Option<String>,
    pub holder_kind: Option<HolderKind>,
    pub holder_name: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub ttl_remaining: Option<Duration>,
}

impl LockStatus {
    pub fn unlocked(branch_id: &str) -> Self {
        Self {
            branch_id: branch_id.to_string(),
            state: LockState::Editable,
            holder_id: None,
            holder_kind: None,
            holder_name: None,
            acquired_at: None,
            ttl_remaining: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.holder_id.is_some()
    }
}
