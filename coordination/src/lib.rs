//! Dialectic: convergence and coordination engine for multi-agent debate.
//!
//! This library provides:
//! - Branch locks with TTLs, holder-checked release and a global interrupt
//! - A phase pipeline that forks candidate branches, audits them, debates
//!   them under locks and synthesizes a single decision
//! - Pareto filtering, resource allocation and a best-response equilibrium
//!   for arbitrating between branches
//! - Oscillation, entropy-stagnation and round-limit stopping rules
//! - Path and Monte Carlo sensitivity analysis of the reasoning graph
//!
//! # Layout
//!
//! ```text
//!                  ┌─────────────────────────┐
//!                  │   PhaseOrchestrator     │
//!                  └──┬──────┬──────┬─────┬──┘
//!          agents ◀───┘      │      │     └───▶ events (bus)
//!                      arbiter  convergence
//!                         │          │
//!                      pareto      oracle
//!                            ▲
//!     analysis ◀── graph ◀───┴── lock ◀── store
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Offline run with the default configuration
//! dialectic --goal "choose a storage engine" --constraint "must be open source"
//!
//! # Live oracle and a config file
//! DIALECTIC_ORACLE_URL=http://localhost:8000/v1 dialectic --config engine.toml --goal "..."
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod agents;
pub mod analysis;
pub mod arbiter;
pub mod config;
pub mod convergence;
pub mod error;
pub mod events;
pub mod graph;
pub mod lock;
pub mod oracle;
pub mod orchestrator;
pub mod pareto;
pub mod store;

// Re-export configuration and error types
pub use config::{
    ArbiterConfig, ConfigError, ConvergenceConfig, EngineConfig, LockConfig, OracleConfig,
    ParetoConfig, PipelineConfig, SensitivityConfig,
};
pub use error::{EngineError, EngineResult};

// Re-export key graph types
pub use graph::{
    Branch, BranchId, BranchStatus, Edge, EdgeKind, GraphError, GraphSnapshot, GraphStore,
    LockState, MemoryGraphStore, Node, NodeContent, NodeId, NodeKind, SharedGraphStore,
};

// Re-export lock protocol types
pub use lock::{
    BranchLockService, HolderKind, HolderMeta, LockError, LockRecord, LockStatus, LockToken,
    SharedLockService,
};
pub use store::{CoordinationStore, MemoryStore, SharedCoordinationStore};

// Re-export key event types
pub use events::{EngineEvent, EventBus, EventEnvelope, EventFilter, SharedEventBus};

// Re-export oracle types
pub use oracle::{LiveOracle, NullOracle, Oracle, SharedOracle};

// Re-export arbitration and convergence types
pub use arbiter::{ArbiterDecision, BranchSnapshot, GameArbiter, RoundInput, RoundOutcome};
pub use convergence::{
    ConvergenceSession, ConvergenceStatus, ConvergenceTrigger, SemanticEntropyCalculator,
};
pub use pareto::{Candidate, Objective, ParetoOptimizer};

// Re-export analysis types
pub use analysis::{PathAnalyzer, PathReport, ReasoningGraph, SensitivityAnalyzer, SensitivityReport};

// Re-export agent and pipeline types
pub use agents::{AgentRole, AgentSet, AuditReport, Auditor, Debater, Generator};
pub use orchestrator::{
    CompiledOutput, Phase, PhaseOrchestrator, PipelineOutcome, PipelineState, SessionRequest,
};
