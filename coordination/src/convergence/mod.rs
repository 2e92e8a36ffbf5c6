//! Debate stopping rules.
//!
//! A [`ConvergenceSession`] accumulates one snapshot per debate round and
//! answers "should debate stop now?" with a [`ConvergenceTrigger`].
//!
//! ```text
//!   record_round(positions, entropy)
//!              │
//!              ▼
//!   ┌──────────────────────┐   checked in order
//!   │ sliding window (N)   │──▶ 1. MaxRounds
//!   └──────────────────────┘    2. Oscillation  (A → B → A)
//!                               3. EntropyStagnation
//! ```
//!
//! Entropy is semantic entropy from [`SemanticEntropyCalculator`]:
//! responses are clustered by mutual entailment and Shannon entropy is
//! taken over cluster sizes.

pub mod controller;
pub mod entropy;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::BranchId;

pub use controller::{ConvergenceSession, ConvergenceSnapshot, ConvergenceStatus};
pub use entropy::{SemanticEntropyCalculator, UncertaintyEstimate};

/// Why debate stopped.
///
/// The arbiter's fallback heuristics produce the same type so callers
/// never special-case where a trigger came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConvergenceTrigger {
    /// Round ceiling reached
    MaxRounds { rounds: u32 },

    /// Positions of one branch alternate between two poles
    Oscillation {
        branch_id: BranchId,
        /// Similarity of rounds r-2 and r
        sim_far: f64,
        /// Similarity of rounds r-2 and r-1
        sim_first: f64,
        /// Similarity of rounds r-1 and r
        sim_second: f64,
    },

    /// Entropy failed to fall over the recent window
    EntropyStagnation { recent: Vec<f64> },

    /// Branch utilities are within the spread threshold
    UtilityConvergence { spread: f64 },

    /// Only one branch remains
    SingleBranch,

    /// Operator asked for synthesis
    UserForced,
}

impl ConvergenceTrigger {
    pub fn kind(&self) -> &'static str {
        match self {
            ConvergenceTrigger::MaxRounds { .. } => "max_rounds",
            ConvergenceTrigger::Oscillation { .. } => "oscillation",
            ConvergenceTrigger::EntropyStagnation { .. } => "entropy_stagnation",
            ConvergenceTrigger::UtilityConvergence { .. } => "utility_convergence",
            ConvergenceTrigger::SingleBranch => "single_branch",
            ConvergenceTrigger::UserForced => "user_forced",
        }
    }
}

impl fmt::Display for ConvergenceTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceTrigger::MaxRounds { rounds } => write!(f, "max_rounds({rounds})"),
            ConvergenceTrigger::Oscillation { branch_id, sim_far, .. } => {
                write!(f, "oscillation({branch_id}, {sim_far:.2})")
            }
            ConvergenceTrigger::UtilityConvergence { spread } => {
                write!(f, "utility_convergence({spread:.3})")
            }
            other => write!(f, "{}", other.kind()),
        }
    }
}
