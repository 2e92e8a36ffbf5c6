//! The phase pipeline: divergence, filtering, convergence, compilation.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{PhaseTransition, PipelineSession, PipelineState};
use super::{OrchestratorError, OrchestratorResult, Phase};
use crate::agents::{AgentRole, AgentSet, AuditReport, DebateRequest, Position, Proposal};
use crate::arbiter::{ArbiterDecision, BranchSnapshot, GameArbiter, RoundInput};
use crate::config::EngineConfig;
use crate::convergence::{ConvergenceSession, ConvergenceTrigger, SemanticEntropyCalculator};
use crate::events::{EngineEvent, EventBus, SharedEventBus};
use crate::graph::{
    Branch, BranchId, BranchStatus, Edge, EdgeKind, GraphSnapshot, MemoryGraphStore, Node,
    NodeContent, NodeId, NodeKind, SharedGraphStore,
};
use crate::lock::{BranchLockService, HolderMeta, LockError, LockToken, SharedLockService};
use crate::oracle::{self, GenerateOptions, NullOracle, PromptTask, SharedOracle};
use crate::store::{MemoryStore, SharedCoordinationStore};

/// Risk assumed for a branch whose claim carries no risk score.
const DEFAULT_RISK: f64 = 0.5;

/// Holder name used for the orchestrator's own writes.
const ORCHESTRATOR_HOLDER: &str = "orchestrator";

/// Wording that marks a constraint as hard.
const HARD_MARKERS: [&str; 5] = ["must", "required", "cannot", "never", "shall"];

/// A goal plus its initial constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub goal: String,
    pub constraints: Vec<String>,
}

impl SessionRequest {
    pub fn new(goal: &str) -> Self {
        Self {
            goal: goal.to_string(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: &str) -> Self {
        self.constraints.push(constraint.to_string());
        self
    }
}

/// Whether a constraint's wording makes it hard.
pub fn is_hard_constraint(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| HARD_MARKERS.contains(&word))
}

/// Condensed audit outcome carried in the compiled output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub compliant: bool,
    pub contradictions: usize,
    pub hard_violations: usize,
    pub soft_violations: usize,
    pub cycles: usize,
    pub stability_score: Option<f64>,
    pub critical_nodes: usize,
}

impl From<&AuditReport> for AuditSummary {
    fn from(report: &AuditReport) -> Self {
        Self {
            compliant: report.is_compliant,
            contradictions: report.contradictions.len(),
            hard_violations: report.hard_violations().count(),
            soft_violations: report.soft_violations().count(),
            cycles: report.cycles.len(),
            stability_score: report.sensitivity.as_ref().map(|s| s.stability_score),
            critical_nodes: report
                .sensitivity
                .as_ref()
                .map(|s| s.critical_nodes.len())
                .unwrap_or(0),
        }
    }
}

/// Final artifact of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledOutput {
    pub goal: String,
    pub decision: String,
    pub synthesis: String,
    pub synthesis_node_id: NodeId,
    /// Branch the synthesis was written to. Differs from the best branch
    /// only when every ranked branch was held by someone else.
    pub synthesis_branch_id: BranchId,
    pub best_branch_id: BranchId,
    pub best_branch_name: String,
    pub trigger: ConvergenceTrigger,
    pub rounds: u32,
    pub audit: AuditSummary,
    pub recommendations: Vec<String>,
    pub markdown: String,
}

/// Everything a finished run returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub session_id: String,
    pub phase: Phase,
    pub output: CompiledOutput,
    pub audit: AuditReport,
    pub transitions: Vec<PhaseTransition>,
}

/// One branch's debate turn for a round.
struct DebateTurn {
    request: DebateRequest,
    parent_id: NodeId,
    layer: u32,
}

/// Result of the synthesis step.
struct SynthesisResult {
    node: Node,
    host_id: BranchId,
    best: BranchSnapshot,
    best_name: String,
}

/// Drives one session through the phase pipeline.
///
/// All graph writes happen under a branch lock token taken with bounded
/// exponential backoff, renewed while slow work runs. A contended branch is
/// skipped, never fatal. A global interrupt, seen before any unit of work,
/// aborts the run.
pub struct PhaseOrchestrator {
    session_id: String,
    config: EngineConfig,
    graph: SharedGraphStore,
    locks: SharedLockService,
    events: SharedEventBus,
    oracle: SharedOracle,
    agents: AgentSet,
    state: RwLock<PipelineSession>,
    force_synthesis: AtomicBool,
    interrupted: AtomicBool,
}

impl PhaseOrchestrator {
    pub fn new(
        session_id: &str,
        config: EngineConfig,
        graph: SharedGraphStore,
        locks: SharedLockService,
        events: SharedEventBus,
        oracle: SharedOracle,
    ) -> Self {
        let agents = AgentSet::from_oracle(oracle.clone(), config.sensitivity.clone());
        Self {
            session_id: session_id.to_string(),
            config,
            graph,
            locks,
            events,
            oracle,
            agents,
            state: RwLock::new(PipelineSession::new(session_id)),
            force_synthesis: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Fully in-process engine with a fresh session id.
    pub fn in_memory(config: EngineConfig) -> Self {
        let events = EventBus::new().shared();
        let store: SharedCoordinationStore = MemoryStore::new().shared();
        let locks = BranchLockService::new(store, config.lock.clone())
            .with_events(events.clone())
            .shared();
        let graph = MemoryGraphStore::new().shared();
        let oracle = oracle::from_config(&config.oracle);
        Self::new(&Uuid::new_v4().to_string(), config, graph, locks, events, oracle)
    }

    /// Replace the oracle-backed agents.
    pub fn with_agents(mut self, agents: AgentSet) -> Self {
        self.agents = agents;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &SharedGraphStore {
        &self.graph
    }

    pub fn locks(&self) -> &SharedLockService {
        &self.locks
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    /// Run the whole pipeline for `request`.
    ///
    /// On failure the session moves to `Aborted` and the error is returned.
    pub async fn run(&self, request: SessionRequest) -> OrchestratorResult<PipelineOutcome> {
        let mut interrupts = self.locks.subscribe_interrupts(&self.session_id).await?;
        info!(session_id = %self.session_id, goal = %request.goal, "Pipeline started");

        match self.drive(&request, &mut interrupts).await {
            Ok(outcome) => {
                info!(
                    session_id = %self.session_id,
                    best_branch = %outcome.output.best_branch_id,
                    trigger = %outcome.output.trigger,
                    "Pipeline completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Pipeline aborted");
                if !matches!(e, OrchestratorError::InvalidTransition { .. }) {
                    if let Err(t) = self.transition(Phase::Aborted, &e.to_string()).await {
                        debug!(error = %t, "Session already terminal");
                    }
                }
                Err(e)
            }
        }
    }

    /// Add a constraint from a user. Allowed only while the main branch is
    /// unlocked or user-locked by this same user.
    pub async fn handle_user_input(&self, user_id: &str, text: &str) -> OrchestratorResult<Node> {
        let (goal_id, main_id) = {
            let state = self.state.read().await;
            (state.goal_id.clone(), state.main_branch_id.clone())
        };
        let (Some(goal_id), Some(main_id)) = (goal_id, main_id) else {
            return Err(OrchestratorError::NotStarted(self.session_id.clone()));
        };

        // A user already holding the branch keeps the lock afterwards.
        let (token, held_before) = match self.locks.user_token(&main_id, user_id).await? {
            Some(token) => (token, true),
            None => match self.locks.request_user_lock(&main_id, user_id, None).await {
                Ok(token) => (token, false),
                Err(e) if e.is_contention() => {
                    return Err(OrchestratorError::NotEditable {
                        branch_id: main_id,
                        user_id: user_id.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            },
        };

        let node = Node::new(
            &self.session_id,
            NodeContent::Constraint {
                text: text.to_string(),
                hard: is_hard_constraint(text),
            },
            1,
        )
        .with_branch(&main_id)
        .with_parent(&goal_id)
        .with_metadata("user_id", json!(user_id));
        let result = self.write_node(&token, node).await;

        if !held_before {
            self.release_quietly(token).await;
        }
        let node = result?;
        info!(session_id = %self.session_id, user_id, node_id = %node.id, "User constraint added");
        Ok(node)
    }

    /// Pause every branch of the session. The running pipeline aborts at
    /// its next checkpoint.
    pub async fn interrupt(&self, user_id: &str) -> OrchestratorResult<usize> {
        self.interrupted.store(true, Ordering::SeqCst);
        Ok(self.locks.trigger_global_interrupt(&self.session_id, user_id).await?)
    }

    /// Ask the convergence loop to synthesize after the current round.
    pub fn request_synthesis(&self) {
        self.force_synthesis.store(true, Ordering::SeqCst);
    }

    pub async fn get_current_state(&self) -> PipelineState {
        let state = self.state.read().await.clone();
        let (active_branches, node_count) = match self.graph.snapshot(&self.session_id) {
            Ok(snapshot) => (snapshot.active_branches().count(), snapshot.nodes.len()),
            Err(_) => (0, 0),
        };
        PipelineState {
            session_id: state.session_id,
            phase: state.phase,
            progress: state.progress,
            round: state.round,
            active_branches,
            node_count,
            trigger: state.trigger,
            convergence: state.convergence,
            transitions: state.transitions,
        }
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn drive(
        &self,
        request: &SessionRequest,
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<PipelineOutcome> {
        self.transition(Phase::Divergence, "session started").await?;
        let (goal, main) = self.initialize(request).await?;
        let mut constraints_written = self
            .write_constraints(&goal.id, &main.id, &request.constraints, interrupts)
            .await?;
        self.diverge(&goal, &main, &request.constraints, interrupts).await?;

        let mut arbiter = GameArbiter::new(self.config.arbiter.clone(), self.config.pareto.clone())
            .with_events(self.events.clone(), &self.session_id);

        self.transition(Phase::Filtering, "candidates forked").await?;
        if !constraints_written {
            constraints_written = self
                .write_constraints(&goal.id, &main.id, &request.constraints, interrupts)
                .await?;
            if !constraints_written {
                warn!(session_id = %self.session_id, "Main branch held throughout; constraints not recorded");
            }
        }
        self.filter(&arbiter, &main.id, interrupts).await?;

        self.transition(Phase::Convergence, "filtering done").await?;
        let (trigger, rounds) = self.converge(&mut arbiter, &goal, &main.id, interrupts).await?;
        self.state.write().await.trigger = Some(trigger.clone());
        let synthesis = self.synthesize(&arbiter, &main.id, interrupts).await?;

        self.transition(Phase::Compilation, &format!("converged: {trigger}")).await?;
        let (output, audit) = self
            .compile(&goal, &main.id, &synthesis, trigger, rounds, interrupts)
            .await?;

        self.transition(Phase::Completed, "output compiled").await?;
        let state = self.state.read().await;
        Ok(PipelineOutcome {
            session_id: self.session_id.clone(),
            phase: state.phase,
            output,
            audit,
            transitions: state.transitions.clone(),
        })
    }

    /// Create the session graph and register main.
    async fn initialize(&self, request: &SessionRequest) -> OrchestratorResult<(Node, Branch)> {
        let (goal, main) = self.graph.create_session(&self.session_id, &request.goal)?;
        self.locks
            .register_branch_for_session(&self.session_id, &main.id)
            .await?;
        {
            let mut state = self.state.write().await;
            state.goal = request.goal.clone();
            state.goal_id = Some(goal.id.clone());
            state.main_branch_id = Some(main.id.clone());
        }
        self.emit_node(&goal);
        Ok((goal, main))
    }

    /// Write the initial constraints to main. Returns false, writing
    /// nothing, when someone else holds main.
    async fn write_constraints(
        &self,
        goal_id: &str,
        main_id: &str,
        texts: &[String],
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<bool> {
        if texts.is_empty() {
            return Ok(true);
        }
        let token = match self.acquire_with_backoff(main_id, ORCHESTRATOR_HOLDER).await {
            Ok(token) => token,
            Err(e) if e.is_contention() => {
                self.check_interrupt(interrupts).await?;
                warn!(session_id = %self.session_id, branch_id = main_id, "Main branch contended, constraints deferred");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut result = Ok(());
        for text in texts {
            let node = Node::new(
                &self.session_id,
                NodeContent::Constraint {
                    text: text.clone(),
                    hard: is_hard_constraint(text),
                },
                1,
            )
            .with_branch(main_id)
            .with_parent(goal_id);
            if let Err(e) = self.write_node(&token, node).await {
                result = Err(e);
                break;
            }
        }
        self.release_quietly(token).await;
        result?;

        debug!(count = texts.len(), "Constraints written");
        Ok(true)
    }

    /// Generate candidates and fork one branch for each of the best.
    async fn diverge(
        &self,
        goal: &Node,
        main: &Branch,
        constraints: &[String],
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<usize> {
        self.check_interrupt(interrupts).await?;
        let started = Instant::now();
        self.emit_agent_started(AgentRole::Generator, None);
        let mut proposals = self
            .agents
            .generator
            .propose(goal.text(), constraints, self.config.pipeline.divergence_candidates)
            .await?;
        self.emit_agent_completed(AgentRole::Generator, None, started);

        proposals.sort_by(|a, b| b.utility().total_cmp(&a.utility()));
        proposals.truncate(self.config.pipeline.max_branches);
        if proposals.is_empty() {
            return Err(OrchestratorError::NoBranches);
        }

        let total = proposals.len();
        let mut forked = 0;
        for (i, proposal) in proposals.iter().enumerate() {
            self.check_interrupt(interrupts).await?;
            let branch = main.fork(proposal.strategy.as_str(), &goal.id);
            let name = branch.name.clone();
            let message = match self.fork_candidate(goal, main, branch, proposal, interrupts).await? {
                Some(_) => {
                    forked += 1;
                    format!("forked branch {name}")
                }
                None => format!("skipped contended branch {name}"),
            };
            self.progress((i + 1) as f64 / total as f64, &message).await;
        }
        if forked == 0 {
            return Err(OrchestratorError::NoBranches);
        }
        info!(session_id = %self.session_id, branches = forked, skipped = total - forked, "Divergence complete");
        Ok(forked)
    }

    /// Register `branch` and write its candidate claim. A branch someone
    /// else holds is pruned and `None` returned.
    async fn fork_candidate(
        &self,
        goal: &Node,
        main: &Branch,
        mut branch: Branch,
        proposal: &Proposal,
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<Option<Branch>> {
        branch.set_utility(proposal.utility());
        self.graph.put_branch(branch.clone())?;
        self.locks
            .register_branch_for_session(&self.session_id, &branch.id)
            .await?;
        self.emit(EngineEvent::BranchForked {
            branch_id: branch.id.clone(),
            parent_branch_id: main.id.clone(),
            at_node_id: goal.id.clone(),
            timestamp: Utc::now(),
        });

        let token = match self
            .acquire_with_backoff(&branch.id, AgentRole::Generator.holder_type())
            .await
        {
            Ok(token) => token,
            Err(e) if e.is_contention() => {
                self.check_interrupt(interrupts).await?;
                warn!(branch_id = %branch.id, error = %e, "Candidate branch contended, skipping");
                self.prune_quietly(&branch.id, "contended at fork").await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let result = async {
            let claim = Node::new(&self.session_id, NodeContent::claim(proposal.content.clone()), 1)
                .with_branch(&branch.id)
                .with_parent(&goal.id)
                .with_confidence(proposal.confidence())
                .with_utility(proposal.utility())
                .with_metadata("strategy", json!(proposal.strategy.as_str()))
                .with_metadata("feasibility", json!(proposal.feasibility))
                .with_metadata("novelty", json!(proposal.novelty))
                .with_metadata("risk", json!(proposal.risk));
            let claim = self.write_node(&token, claim).await?;
            let edge = Edge::new(&self.session_id, &goal.id, &claim.id, EdgeKind::Decompose)?;
            self.write_edge(&token, edge).await?;
            Ok::<_, OrchestratorError>(())
        }
        .await;
        self.release_quietly(token).await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_contention() => {
                self.check_interrupt(interrupts).await?;
                warn!(branch_id = %branch.id, error = %e, "Candidate lease lost, skipping");
                self.prune_quietly(&branch.id, "lease lost at fork").await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        debug!(branch_id = %branch.id, strategy = %proposal.strategy, utility = proposal.utility(), "Branch forked");
        Ok(Some(branch))
    }

    /// Audit, then keep the Pareto-best branches above the prune threshold.
    async fn filter(
        &self,
        arbiter: &GameArbiter,
        main_id: &str,
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<AuditReport> {
        self.check_interrupt(interrupts).await?;
        let snapshot = self.graph.snapshot(&self.session_id)?;
        let report = self.audit(&snapshot).await?;
        self.progress(0.5, "audit complete").await;

        let snaps = branch_snapshots(&snapshot, main_id);
        let candidates: Vec<_> = snaps.iter().map(BranchSnapshot::to_candidate).collect();
        let kept: HashSet<String> = arbiter
            .optimizer()
            .filter_solutions(&candidates, self.config.pipeline.max_branches)
            .into_iter()
            .map(|c| c.id)
            .collect();

        let threshold = self.config.pipeline.prune_threshold;
        let mut doomed: Vec<(BranchId, String)> = snaps
            .iter()
            .filter_map(|b| {
                if !kept.contains(&b.id) {
                    Some((b.id.clone(), "dominated on the pareto front".to_string()))
                } else if b.utility < threshold {
                    Some((b.id.clone(), format!("utility {:.3} below {threshold}", b.utility)))
                } else {
                    None
                }
            })
            .collect();

        // Never prune the last candidate.
        if doomed.len() == snaps.len() {
            if let Some(best) = arbiter.select_best_branch(&snaps) {
                doomed.retain(|(id, _)| *id != best.id);
            }
        }

        let mut pruned = 0;
        for (branch_id, reason) in &doomed {
            if self.prune_quietly(branch_id, reason).await {
                pruned += 1;
            }
        }
        info!(
            session_id = %self.session_id,
            kept = snaps.len() - pruned,
            pruned,
            compliant = report.is_compliant,
            "Filtering complete"
        );
        self.progress(1.0, "filtering complete").await;
        Ok(report)
    }

    /// Debate rounds until the arbiter fires a trigger. Returns the trigger
    /// and the number of rounds recorded.
    async fn converge(
        &self,
        arbiter: &mut GameArbiter,
        goal: &Node,
        main_id: &str,
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<(ConvergenceTrigger, u32)> {
        let mut session = ConvergenceSession::new(self.config.convergence.clone(), self.oracle.clone());
        let entropy = SemanticEntropyCalculator::new(self.oracle.clone(), &self.config.convergence);
        let max_rounds = self.config.convergence.max_rounds.max(1);

        loop {
            self.check_interrupt(interrupts).await?;
            if self.force_synthesis.swap(false, Ordering::SeqCst) {
                session.force_convergence();
            }

            let snapshot = self.graph.snapshot(&self.session_id)?;
            let branches = debating_branches(&snapshot, main_id);
            if branches.len() <= 1 {
                let trigger = ConvergenceTrigger::SingleBranch;
                info!(session_id = %self.session_id, round = session.round(), "One branch left");
                self.emit(EngineEvent::ConvergenceTriggered {
                    round: session.round(),
                    trigger: trigger.clone(),
                    timestamp: Utc::now(),
                });
                return Ok((trigger, session.round()));
            }

            let round = session.round() + 1;
            let turns: Vec<DebateTurn> = branches
                .iter()
                .filter_map(|b| debate_turn(&snapshot, goal, b, round))
                .collect();
            let results = join_all(turns.into_iter().map(|turn| self.debate_branch(turn))).await;

            let mut positions = BTreeMap::new();
            for result in results {
                match result {
                    Ok(position) => {
                        positions.insert(position.branch_id, position.text);
                    }
                    Err(e) if e.is_interrupt() => return Err(e),
                    Err(e) => warn!(round, error = %e, "Branch skipped this round"),
                }
            }

            // A round cut short by an interrupt is not recorded.
            self.check_interrupt(interrupts).await?;

            let texts: Vec<String> = positions.values().cloned().collect();
            let h = entropy.entropy(&texts).await;
            let argued: Vec<BranchId> = positions.keys().cloned().collect();
            session.record_round(positions, h);
            for branch_id in &argued {
                if let Err(e) = self.mark_debate_round(branch_id, round) {
                    warn!(round, branch_id = %branch_id, error = %e, "Branch round not recorded");
                }
            }

            let snapshot = self.graph.snapshot(&self.session_id)?;
            let snaps = branch_snapshots(&snapshot, main_id);
            let input = RoundInput {
                conflict_matrix: Some(GameArbiter::utility_conflict_matrix(&snaps)),
                branches: snaps,
            };
            let outcome = arbiter.run_round(input, Some(&session)).await?;
            {
                let mut state = self.state.write().await;
                state.round = round;
                state.convergence = Some(session.status());
            }
            self.progress(
                (round as f64 / max_rounds as f64).min(1.0),
                &format!("debate round {round}, entropy {h:.3}"),
            )
            .await;

            if let ArbiterDecision::Synthesize { trigger } = outcome.decision {
                return Ok((trigger, round));
            }

            if let Some(nash) = &outcome.nash {
                let mut remaining = branches.len();
                for branch_id in &nash.eliminated {
                    if remaining <= 1 {
                        break;
                    }
                    if self.prune_quietly(branch_id, "eliminated by equilibrium").await {
                        remaining -= 1;
                    }
                }
            }
        }
    }

    async fn debate_branch(&self, turn: DebateTurn) -> OrchestratorResult<Position> {
        let branch_id = turn.request.branch_id.clone();
        let token = self
            .acquire_with_backoff(&branch_id, AgentRole::Debater.holder_type())
            .await?;
        let result = self.with_lease(&token, self.argue_under_lock(&token, &turn)).await;
        self.release_quietly(token).await;
        result
    }

    async fn argue_under_lock(&self, token: &LockToken, turn: &DebateTurn) -> OrchestratorResult<Position> {
        let started = Instant::now();
        let branch_id = &turn.request.branch_id;
        self.emit_agent_started(AgentRole::Debater, Some(branch_id));

        let position = self.agents.debater.argue(&turn.request).await?;
        let node = Node::new(&self.session_id, NodeContent::claim(position.text.clone()), turn.layer)
            .with_branch(branch_id)
            .with_parent(&turn.parent_id)
            .with_confidence(position.confidence)
            .with_utility(position.utility)
            .with_metadata("round", json!(position.round));
        let node = self.write_node(token, node).await?;
        let edge = Edge::new(&self.session_id, &turn.parent_id, &node.id, EdgeKind::Derive)?;
        self.write_edge(token, edge).await?;

        self.emit_agent_completed(AgentRole::Debater, Some(branch_id), started);
        Ok(position)
    }

    /// Write the synthesis node and merge the other branches into its host.
    ///
    /// The host is the best-ranked branch that can be locked. When every
    /// ranked branch is held elsewhere, a branch forked from the best one's
    /// latest position hosts the synthesis instead.
    async fn synthesize(
        &self,
        arbiter: &GameArbiter,
        main_id: &str,
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<SynthesisResult> {
        self.check_interrupt(interrupts).await?;
        let snapshot = self.graph.snapshot(&self.session_id)?;
        let snaps = branch_snapshots(&snapshot, main_id);
        let ranked = arbiter.rank_branches(&snaps);
        let Some(&top) = ranked.first() else {
            return Err(OrchestratorError::NoBranches);
        };

        let mut locked = None;
        for &candidate in &ranked {
            match self
                .acquire_with_backoff(&candidate.id, AgentRole::Arbiter.holder_type())
                .await
            {
                Ok(token) => {
                    locked = Some((candidate, token));
                    break;
                }
                Err(e) if e.is_contention() => {
                    self.check_interrupt(interrupts).await?;
                    warn!(branch_id = %candidate.id, error = %e, "Branch contended, trying next for synthesis");
                }
                Err(e) => return Err(e),
            }
        }
        let (best, token) = match locked {
            Some((branch, token)) => (branch.clone(), token),
            None => (top.clone(), self.fork_synthesis_host(&snapshot, &top.id).await?),
        };
        let host_id = token.branch_id().to_string();
        let best_name = snapshot
            .branch(&best.id)
            .map(|b| b.name.clone())
            .unwrap_or_default();

        let sources: Vec<&Node> = snaps
            .iter()
            .filter_map(|b| snapshot.latest_position(&b.id))
            .collect();
        let result = async {
            let anchor = snapshot
                .latest_position(&best.id)
                .ok_or(OrchestratorError::NoBranches)?;
            let mut prompt = format!("{}\n", best.main_claim);
            for node in &sources {
                prompt.push_str(&format!("Position: {}\n", node.text()));
            }
            let text = self
                .with_lease(
                    &token,
                    self.generate_or_render(&prompt, PromptTask::Synthesis { branches: sources.len() }),
                )
                .await;
            let confidence =
                sources.iter().map(|n| n.confidence).sum::<f64>() / sources.len().max(1) as f64;

            let node = Node::new(
                &self.session_id,
                NodeContent::Synthesis {
                    text,
                    source_branches: snaps.iter().map(|b| b.id.clone()).collect(),
                },
                snapshot.max_layer() + 1,
            )
            .with_branch(&host_id)
            .with_parent(&anchor.id)
            .with_confidence(confidence)
            .with_utility(best.utility);
            let node = self.write_node(&token, node).await?;
            for source in &sources {
                let edge = Edge::new(&self.session_id, &source.id, &node.id, EdgeKind::Derive)?;
                self.write_edge(&token, edge).await?;
            }
            Ok::<_, OrchestratorError>(node)
        }
        .await;
        self.release_quietly(token).await;
        let node = result?;

        for other in snaps.iter().filter(|b| b.id != host_id && b.id != best.id) {
            if let Err(e) = self.merge_branch(&other.id, &host_id).await {
                warn!(branch_id = %other.id, error = %e, "Branch not merged");
            }
        }

        info!(
            session_id = %self.session_id,
            best_branch = %best.id,
            host_branch = %host_id,
            sources = sources.len(),
            "Synthesis written"
        );
        Ok(SynthesisResult {
            node,
            host_id,
            best,
            best_name,
        })
    }

    /// Fork a fresh branch off `best_id`'s latest position and lock it.
    async fn fork_synthesis_host(&self, snapshot: &GraphSnapshot, best_id: &str) -> OrchestratorResult<LockToken> {
        let (Some(best), Some(anchor)) = (snapshot.branch(best_id), snapshot.latest_position(best_id)) else {
            return Err(OrchestratorError::NoBranches);
        };
        let mut host = best.fork("synthesis", &anchor.id);
        host.set_utility(best.utility_score);
        self.graph.put_branch(host.clone())?;
        self.locks
            .register_branch_for_session(&self.session_id, &host.id)
            .await?;
        self.emit(EngineEvent::BranchForked {
            branch_id: host.id.clone(),
            parent_branch_id: best.id.clone(),
            at_node_id: anchor.id.clone(),
            timestamp: Utc::now(),
        });
        warn!(branch_id = %host.id, forked_from = best_id, "Every ranked branch contended, synthesizing on a fresh branch");
        self.acquire_with_backoff(&host.id, AgentRole::Arbiter.holder_type())
            .await
    }

    async fn merge_branch(&self, branch_id: &str, into: &str) -> OrchestratorResult<()> {
        let mut branch = self.graph.get_branch(&self.session_id, branch_id)?;
        branch.merge_into(into)?;
        self.graph.put_branch(branch)?;
        self.locks
            .unregister_branch_for_session(&self.session_id, branch_id)
            .await?;
        self.emit(EngineEvent::BranchMerged {
            branch_id: branch_id.to_string(),
            into_branch_id: into.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn compile(
        &self,
        goal: &Node,
        main_id: &str,
        synthesis: &SynthesisResult,
        trigger: ConvergenceTrigger,
        rounds: u32,
        interrupts: &mut broadcast::Receiver<String>,
    ) -> OrchestratorResult<(CompiledOutput, AuditReport)> {
        self.check_interrupt(interrupts).await?;
        let snapshot = self.graph.snapshot(&self.session_id)?;
        let audit = self.audit(&snapshot).await?;

        let started = Instant::now();
        self.emit_agent_started(AgentRole::Compiler, Some(&synthesis.best.id));
        let prompt = format!("{}\nGoal: {}\n", synthesis.node.text(), goal.text());
        let decision = self.generate_or_render(&prompt, PromptTask::Compilation).await;
        self.emit_agent_completed(AgentRole::Compiler, Some(&synthesis.best.id), started);

        let mut finished = vec![synthesis.best.id.as_str(), synthesis.host_id.as_str(), main_id];
        finished.dedup();
        for branch_id in finished {
            if let Err(e) = self.complete_branch(branch_id) {
                warn!(branch_id, error = %e, "Branch not marked completed");
            }
        }

        let recommendations: Vec<String> = audit
            .sensitivity
            .as_ref()
            .map(|s| s.recommendations.iter().map(|r| r.message.clone()).collect())
            .unwrap_or_default();
        let mut output = CompiledOutput {
            goal: goal.text().to_string(),
            decision,
            synthesis: synthesis.node.text().to_string(),
            synthesis_node_id: synthesis.node.id.clone(),
            synthesis_branch_id: synthesis.host_id.clone(),
            best_branch_id: synthesis.best.id.clone(),
            best_branch_name: synthesis.best_name.clone(),
            trigger,
            rounds,
            audit: AuditSummary::from(&audit),
            recommendations,
            markdown: String::new(),
        };
        output.markdown = render_markdown(&output);
        self.progress(1.0, "output compiled").await;
        Ok((output, audit))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn audit(&self, snapshot: &GraphSnapshot) -> OrchestratorResult<AuditReport> {
        let started = Instant::now();
        self.emit_agent_started(AgentRole::Auditor, None);
        let report = self.agents.auditor.audit(snapshot).await?;
        self.emit_agent_completed(AgentRole::Auditor, None, started);
        self.emit(EngineEvent::AuditCompleted {
            compliant: report.is_compliant,
            violations: report.constraints.iter().filter(|c| !c.is_satisfied()).count(),
            cycles: report.cycles.len(),
            timestamp: Utc::now(),
        });
        Ok(report)
    }

    fn complete_branch(&self, branch_id: &str) -> OrchestratorResult<()> {
        let mut branch = self.graph.get_branch(&self.session_id, branch_id)?;
        if branch.is_active() {
            branch.transition(BranchStatus::Completed)?;
            self.graph.put_branch(branch)?;
        }
        Ok(())
    }

    fn mark_debate_round(&self, branch_id: &str, round: u32) -> OrchestratorResult<()> {
        let mut branch = self.graph.get_branch(&self.session_id, branch_id)?;
        branch.debate_round = round;
        self.graph.put_branch(branch)?;
        Ok(())
    }

    /// Prune, logging instead of failing when the branch is gone or no
    /// longer active. Returns whether the branch was pruned.
    async fn prune_quietly(&self, branch_id: &str, reason: &str) -> bool {
        match self.prune_branch(branch_id, reason).await {
            Ok(()) => true,
            Err(e) => {
                warn!(branch_id, reason, error = %e, "Branch not pruned");
                false
            }
        }
    }

    async fn prune_branch(&self, branch_id: &str, reason: &str) -> OrchestratorResult<()> {
        let mut branch = self.graph.get_branch(&self.session_id, branch_id)?;
        branch.transition(BranchStatus::Pruned)?;
        self.graph.put_branch(branch)?;
        self.locks
            .unregister_branch_for_session(&self.session_id, branch_id)
            .await?;
        info!(session_id = %self.session_id, branch_id, reason, "Branch pruned");
        self.emit(EngineEvent::BranchPruned {
            branch_id: branch_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Take an agent lock, retrying contention with exponential backoff.
    async fn acquire_with_backoff(&self, branch_id: &str, agent: &str) -> OrchestratorResult<LockToken> {
        let attempts = self.config.lock.acquire_attempts.max(1);
        let ttl = Duration::from_secs(self.config.pipeline.agent_ttl_secs);
        let holder_id = format!("{agent}-{}", Uuid::new_v4());
        let meta = HolderMeta::agent(agent, agent);

        let mut last = LockError::Contention {
            branch_id: branch_id.to_string(),
            holder_id: String::new(),
        };
        for attempt in 0..attempts {
            match self
                .locks
                .acquire_agent_lock(branch_id, &holder_id, &meta, Some(ttl))
                .await
            {
                Ok(token) => return Ok(token),
                Err(e) if e.is_contention() => {
                    last = e;
                    if attempt + 1 < attempts {
                        let delay = self.config.lock.backoff_base_ms.saturating_mul(1u64 << attempt.min(16));
                        debug!(branch_id, attempt, delay_ms = delay, "Branch contended, backing off");
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last.into())
    }

    /// Run `work` while renewing the token's lease every half TTL.
    ///
    /// A lost lease is logged and left to the next write to report.
    async fn with_lease<F: Future>(&self, token: &LockToken, work: F) -> F::Output {
        let period = Duration::from_secs((self.config.pipeline.agent_ttl_secs / 2).max(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = renew.tick() => match self.locks.extend(token, period).await {
                    Ok(true) => debug!(branch_id = token.branch_id(), "Lease renewed"),
                    Ok(false) => warn!(branch_id = token.branch_id(), "Lease lost during work"),
                    Err(e) => warn!(branch_id = token.branch_id(), error = %e, "Lease renewal failed"),
                },
            }
        }
    }

    async fn release_quietly(&self, token: LockToken) {
        let branch_id = token.branch_id().to_string();
        match self.locks.release(token).await {
            Ok(true) => {}
            Ok(false) => debug!(%branch_id, "Lock already gone at release"),
            Err(e) => warn!(%branch_id, error = %e, "Failed to release branch lock"),
        }
    }

    async fn write_node(&self, token: &LockToken, node: Node) -> OrchestratorResult<Node> {
        if !self.locks.verify(token).await? {
            return Err(OrchestratorError::LockLost(token.branch_id().to_string()));
        }
        let node = self.graph.upsert_node(token, node)?;
        self.emit_node(&node);
        Ok(node)
    }

    async fn write_edge(&self, token: &LockToken, edge: Edge) -> OrchestratorResult<Edge> {
        if !self.locks.verify(token).await? {
            return Err(OrchestratorError::LockLost(token.branch_id().to_string()));
        }
        let edge = self.graph.upsert_edge(token, edge)?;
        self.emit(EngineEvent::EdgeCreated {
            edge_id: edge.id.clone(),
            source_id: edge.source_id.clone(),
            target_id: edge.target_id.clone(),
            kind: edge.kind,
            timestamp: Utc::now(),
        });
        Ok(edge)
    }

    async fn generate_or_render(&self, prompt: &str, task: PromptTask) -> String {
        let opts = GenerateOptions::for_task(task.clone());
        match self.oracle.generate_once(prompt, &opts).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => NullOracle::render(prompt, &task),
            Err(e) => {
                warn!(error = %e, "Generation failed, using offline rendering");
                NullOracle::render(prompt, &task)
            }
        }
    }

    async fn check_interrupt(&self, interrupts: &mut broadcast::Receiver<String>) -> OrchestratorResult<()> {
        let signalled = match interrupts.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
        };
        if signalled {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        if self.interrupted.load(Ordering::SeqCst) {
            let phase = self.state.read().await.phase;
            return Err(OrchestratorError::Interrupted {
                session_id: self.session_id.clone(),
                phase,
            });
        }
        Ok(())
    }

    async fn transition(&self, to: Phase, reason: &str) -> OrchestratorResult<()> {
        let record = self.state.write().await.transition(to, reason)?;
        info!(session_id = %self.session_id, from = %record.from, to = %record.to, reason, "Phase transition");
        self.emit(EngineEvent::PhaseChanged {
            from: record.from,
            to: record.to,
            reason: record.reason,
            timestamp: record.timestamp,
        });
        Ok(())
    }

    async fn progress(&self, progress: f64, message: &str) {
        let phase = {
            let mut state = self.state.write().await;
            state.progress = progress.clamp(0.0, 1.0);
            state.phase
        };
        self.emit(EngineEvent::ProgressUpdated {
            phase,
            progress: progress.clamp(0.0, 1.0),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.publish(&self.session_id, event);
    }

    fn emit_node(&self, node: &Node) {
        self.emit(EngineEvent::NodeCreated {
            node_id: node.id.clone(),
            branch_id: node.branch_id.clone(),
            kind: node.kind(),
            layer: node.layer,
            timestamp: Utc::now(),
        });
    }

    fn emit_agent_started(&self, agent: AgentRole, branch_id: Option<&str>) {
        self.emit(EngineEvent::AgentStarted {
            agent,
            branch_id: branch_id.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    fn emit_agent_completed(&self, agent: AgentRole, branch_id: Option<&str>, started: Instant) {
        self.emit(EngineEvent::AgentCompleted {
            agent,
            branch_id: branch_id.map(str::to_string),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

/// Active branches that hold at least one claim, main excluded.
fn debating_branches<'a>(snapshot: &'a GraphSnapshot, main_id: &str) -> Vec<&'a Branch> {
    snapshot
        .active_branches()
        .filter(|b| b.id != main_id && snapshot.latest_position(&b.id).is_some())
        .collect()
}

/// The claim a branch was forked with.
fn branch_claim<'a>(snapshot: &'a GraphSnapshot, branch_id: &'a str) -> Option<&'a Node> {
    snapshot
        .branch_nodes(branch_id)
        .filter(|n| n.kind() == NodeKind::Claim)
        .min_by_key(|n| n.layer)
}

fn branch_snapshots(snapshot: &GraphSnapshot, main_id: &str) -> Vec<BranchSnapshot> {
    debating_branches(snapshot, main_id)
        .into_iter()
        .map(|branch| {
            let latest = snapshot.latest_position(&branch.id);
            let risk = branch_claim(snapshot, &branch.id)
                .and_then(|n| n.metadata_f64("risk"))
                .unwrap_or(DEFAULT_RISK);
            BranchSnapshot::new(&branch.id, branch.utility_score)
                .with_confidence(latest.map(|n| n.confidence).unwrap_or(0.5))
                .with_risk(risk)
                .with_claim(latest.map(|n| n.text()).unwrap_or_default())
        })
        .collect()
}

fn debate_turn(snapshot: &GraphSnapshot, goal: &Node, branch: &Branch, round: u32) -> Option<DebateTurn> {
    let latest = snapshot.latest_position(&branch.id)?;
    let claim = branch_claim(snapshot, &branch.id).unwrap_or(latest);
    let opponents = snapshot
        .active_branches()
        .filter(|b| b.id != branch.id)
        .filter_map(|b| snapshot.latest_position(&b.id))
        .map(|n| n.text().to_string())
        .collect();
    Some(DebateTurn {
        request: DebateRequest {
            goal: goal.text().to_string(),
            branch_id: branch.id.clone(),
            round,
            claim: claim.text().to_string(),
            opponents,
        },
        parent_id: latest.id.clone(),
        layer: latest.layer + 1,
    })
}

fn render_markdown(output: &CompiledOutput) -> String {
    let mut md = format!("# Decision\n\n**Goal:** {}\n\n", output.goal);
    md.push_str(&format!("## Recommendation\n\n{}\n\n", output.decision));
    md.push_str(&format!("## Synthesis\n\n{}\n\n", output.synthesis));
    md.push_str("## Debate\n\n");
    md.push_str(&format!("- Winning branch: `{}`\n", output.best_branch_name));
    if output.synthesis_branch_id != output.best_branch_id {
        md.push_str("- Synthesized on a separate branch; the winner was held by a user\n");
    }
    md.push_str(&format!("- Rounds: {}\n", output.rounds));
    md.push_str(&format!("- Stopped by: {}\n\n", output.trigger));

    let audit = &output.audit;
    md.push_str("## Audit\n\n");
    md.push_str(&format!(
        "- Compliant: {}\n- Contradictions: {}\n- Hard violations: {}\n- Soft violations: {}\n- Cycles: {}\n",
        if audit.compliant { "yes" } else { "no" },
        audit.contradictions,
        audit.hard_violations,
        audit.soft_violations,
        audit.cycles,
    ));
    if let Some(stability) = audit.stability_score {
        md.push_str(&format!("- Stability: {stability:.2}\n"));
    }
    if !output.recommendations.is_empty() {
        md.push_str("\n## Recommendations\n\n");
        for r in &output.recommendations {
            md.push_str(&format!("- {r}\n"));
        }
    }
    md
}
