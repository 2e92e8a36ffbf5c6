//! End-to-end pipeline runs against the in-process stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dialectic::agents::{
    AgentResult, AgentSet, AuditReport, Auditor, DebateRequest, Debater, Generator, OracleAuditor,
    OracleDebater, Position, Proposal, Strategy,
};
use dialectic::events::EventBus;
use dialectic::oracle::NullOracle;
use dialectic::{
    BranchLockService, BranchStatus, EngineConfig, EngineEvent, GraphSnapshot, LockState, MemoryGraphStore,
    MemoryStore, NodeKind, Phase, PhaseOrchestrator, SessionRequest, SharedCoordinationStore,
    SharedLockService, SharedOracle,
};

struct Parts {
    locks: SharedLockService,
    oracle: SharedOracle,
    config: EngineConfig,
}

fn parts() -> (Parts, Arc<EventBus>) {
    let mut config = EngineConfig::default();
    config.set_seed(11);
    let events = EventBus::new().shared();
    let store: SharedCoordinationStore = MemoryStore::new().shared();
    let locks = BranchLockService::new(store, config.lock.clone())
        .with_events(events.clone())
        .shared();
    let oracle: SharedOracle = Arc::new(NullOracle::new());
    (Parts { locks, oracle, config }, events)
}

fn engine_with(session_id: &str, parts: &Parts, events: Arc<EventBus>, agents: AgentSet) -> PhaseOrchestrator {
    PhaseOrchestrator::new(
        session_id,
        parts.config.clone(),
        MemoryGraphStore::new().shared(),
        parts.locks.clone(),
        events,
        parts.oracle.clone(),
    )
    .with_agents(agents)
}

/// Fixed proposals, one of them far below the prune threshold.
struct FixedGenerator;

#[async_trait]
impl Generator for FixedGenerator {
    async fn propose(&self, _goal: &str, _constraints: &[String], _count: usize) -> AgentResult<Vec<Proposal>> {
        let make = |strategy, content: &str, f, n, r| Proposal {
            strategy,
            content: content.to_string(),
            feasibility: f,
            novelty: n,
            risk: r,
        };
        Ok(vec![
            make(Strategy::ConstraintRelaxation, "run postgres with synchronous replicas", 0.8, 0.3, 0.2),
            make(Strategy::CrossDomainAnalogy, "treat the ledger like an append only log", 0.6, 0.9, 0.5),
            make(Strategy::HighTemperature, "write a custom storage engine", 0.05, 0.05, 0.95),
        ])
    }
}

/// Debater that fires a global interrupt during the second round.
struct InterruptingDebater {
    inner: OracleDebater,
    locks: SharedLockService,
    session_id: String,
    fired: AtomicBool,
}

#[async_trait]
impl Debater for InterruptingDebater {
    async fn argue(&self, request: &DebateRequest) -> AgentResult<Position> {
        if request.round == 2 && !self.fired.swap(true, Ordering::SeqCst) {
            self.locks
                .trigger_global_interrupt(&self.session_id, "operator")
                .await
                .expect("interrupt");
        }
        self.inner.argue(request).await
    }
}

#[tokio::test]
async fn test_dominated_candidate_is_pruned_before_debate() {
    let (parts, events) = parts();
    let mut agents = AgentSet::from_oracle(parts.oracle.clone(), parts.config.sensitivity.clone());
    agents.generator = Arc::new(FixedGenerator);
    let engine = engine_with("s-prune", &parts, events.clone(), agents);
    let mut rx = events.subscribe();

    let outcome = engine
        .run(SessionRequest::new("pick a ledger store").with_constraint("prefer boring technology"))
        .await
        .unwrap();
    assert_eq!(outcome.phase, Phase::Completed);

    let snapshot = engine.graph().snapshot("s-prune").unwrap();
    let pruned: Vec<_> = snapshot
        .branches
        .iter()
        .filter(|b| b.status == BranchStatus::Pruned)
        .collect();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].name, "high_temperature");
    // Pruned branches never receive debate positions.
    assert_eq!(snapshot.branch_nodes(&pruned[0].id).count(), 1);

    let mut saw_prune = false;
    while let Ok(envelope) = rx.try_recv() {
        if let EngineEvent::BranchPruned { branch_id, .. } = &envelope.event {
            assert_eq!(branch_id, &pruned[0].id);
            saw_prune = true;
        }
    }
    assert!(saw_prune);
    assert!(outcome.output.synthesis.starts_with("Synthesis of 2 positions"));
}

#[tokio::test]
async fn test_interrupt_during_debate_pauses_and_aborts() {
    let (parts, events) = parts();
    let session_id = "s-interrupt";
    let agents = AgentSet {
        generator: AgentSet::from_oracle(parts.oracle.clone(), parts.config.sensitivity.clone()).generator,
        auditor: Arc::new(OracleAuditor::new(parts.oracle.clone(), parts.config.sensitivity.clone())),
        debater: Arc::new(InterruptingDebater {
            inner: OracleDebater::new(parts.oracle.clone()),
            locks: parts.locks.clone(),
            session_id: session_id.to_string(),
            fired: AtomicBool::new(false),
        }),
    };
    let engine = engine_with(session_id, &parts, events, agents);

    let err = engine
        .run(SessionRequest::new("choose a cache"))
        .await
        .unwrap_err();
    assert!(err.is_interrupt(), "unexpected error: {err}");

    let state = engine.get_current_state().await;
    assert_eq!(state.phase, Phase::Aborted);
    assert_eq!(state.round, 1);
    assert_eq!(state.transitions.last().map(|t| t.to), Some(Phase::Aborted));

    // Every registered branch now carries the pause record.
    let branches = parts.locks.session_branches(session_id).await.unwrap();
    assert_eq!(branches.len(), 5);
    for branch_id in &branches {
        let status = parts.locks.get_lock_state(branch_id).await.unwrap();
        assert_eq!(status.state, LockState::Paused);
    }

    // No round-2 position made it into the graph.
    let snapshot = engine.graph().snapshot(session_id).unwrap();
    assert_eq!(snapshot.max_layer(), 2);
    assert_eq!(snapshot.nodes_of_kind(NodeKind::Synthesis).count(), 0);
}

#[tokio::test]
async fn test_user_lock_survives_pipeline_writes_elsewhere() {
    let (parts, events) = parts();
    let engine = engine_with(
        "s-user",
        &parts,
        events,
        AgentSet::from_oracle(parts.oracle.clone(), parts.config.sensitivity.clone()),
    );
    engine.run(SessionRequest::new("plan the migration")).await.unwrap();

    let node = engine.handle_user_input("carol", "never take the ledger offline").await.unwrap();
    match &node.content {
        dialectic::NodeContent::Constraint { hard, .. } => assert!(*hard),
        other => panic!("expected constraint, got {other:?}"),
    }

    let snapshot = engine.graph().snapshot("s-user").unwrap();
    assert_eq!(snapshot.nodes_of_kind(NodeKind::Constraint).count(), 1);
    let main = snapshot.branches.iter().find(|b| b.name == "main").unwrap();
    assert!(parts.locks.get_lock_record(&main.id).await.unwrap().is_none());
}

/// Auditor that, on its first audit, has a user take every branch of the
/// session. Later phases find every branch held.
struct LockingAuditor {
    inner: OracleAuditor,
    locks: SharedLockService,
    session_id: String,
    user_id: String,
    fired: AtomicBool,
}

#[async_trait]
impl Auditor for LockingAuditor {
    async fn audit(&self, snapshot: &GraphSnapshot) -> AgentResult<AuditReport> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let branches = self.locks.session_branches(&self.session_id).await.expect("branches");
            for branch_id in branches {
                self.locks
                    .request_user_lock(&branch_id, &self.user_id, None)
                    .await
                    .expect("user lock");
            }
        }
        self.inner.audit(snapshot).await
    }
}

/// Debater whose every turn outlasts the default agent lease.
struct SlowDebater {
    inner: OracleDebater,
    delay: Duration,
}

#[async_trait]
impl Debater for SlowDebater {
    async fn argue(&self, request: &DebateRequest) -> AgentResult<Position> {
        tokio::time::sleep(self.delay).await;
        self.inner.argue(request).await
    }
}

#[tokio::test]
async fn test_user_held_branches_do_not_abort_session() {
    let (mut parts, events) = parts();
    parts.config.lock.backoff_base_ms = 1;
    let session_id = "s-held";
    let agents = AgentSet {
        generator: AgentSet::from_oracle(parts.oracle.clone(), parts.config.sensitivity.clone()).generator,
        auditor: Arc::new(LockingAuditor {
            inner: OracleAuditor::new(parts.oracle.clone(), parts.config.sensitivity.clone()),
            locks: parts.locks.clone(),
            session_id: session_id.to_string(),
            user_id: "alice".to_string(),
            fired: AtomicBool::new(false),
        }),
        debater: Arc::new(OracleDebater::new(parts.oracle.clone())),
    };
    let engine = engine_with(session_id, &parts, events, agents);

    let outcome = engine
        .run(SessionRequest::new("choose a queue").with_constraint("must survive a zone outage"))
        .await
        .unwrap();
    assert_eq!(outcome.phase, Phase::Completed);

    // The winner stays with alice; the synthesis lands on a fresh branch.
    let output = &outcome.output;
    assert_ne!(output.synthesis_branch_id, output.best_branch_id);
    let snapshot = engine.graph().snapshot(session_id).unwrap();
    let host = snapshot.branch(&output.synthesis_branch_id).unwrap();
    assert_eq!(host.name, "synthesis");
    assert_eq!(
        host.forked_from.as_ref().map(|f| f.branch_id.as_str()),
        Some(output.best_branch_id.as_str())
    );
    let synthesis = snapshot.node(&output.synthesis_node_id).unwrap();
    assert_eq!(synthesis.branch_id.as_deref(), Some(host.id.as_str()));

    // No debate position was written on a held branch.
    assert_eq!(snapshot.max_layer(), 2);
    for branch in snapshot.branches.iter().filter(|b| b.id != host.id) {
        let record = parts.locks.get_lock_record(&branch.id).await.unwrap().unwrap();
        assert_eq!(record.holder_id, "alice");
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_turns_keep_their_writes() {
    let (parts, events) = parts();
    let ttl = parts.config.pipeline.agent_ttl_secs;
    let agents = AgentSet {
        debater: Arc::new(SlowDebater {
            inner: OracleDebater::new(parts.oracle.clone()),
            delay: Duration::from_secs(ttl + ttl / 2),
        }),
        ..AgentSet::from_oracle(parts.oracle.clone(), parts.config.sensitivity.clone())
    };
    let engine = engine_with("s-slow", &parts, events, agents);

    let outcome = engine.run(SessionRequest::new("choose a queue")).await.unwrap();
    assert_eq!(outcome.phase, Phase::Completed);
    assert!(outcome.output.rounds > 0);

    let snapshot = engine.graph().snapshot("s-slow").unwrap();
    let positions = snapshot
        .nodes_of_kind(NodeKind::Claim)
        .filter(|n| n.metadata.contains_key("round"))
        .count();
    assert!(positions > 0);
}
