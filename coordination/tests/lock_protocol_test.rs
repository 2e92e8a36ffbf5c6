//! Branch lock protocol seen through the public API: locks gate graph
//! writes, observers see state changes, and a global pause overrides all.

use std::time::Duration;

use dialectic::events::EventBus;
use dialectic::{
    BranchLockService, EngineEvent, GraphError, GraphStore, HolderKind, HolderMeta, LockConfig,
    LockState, MemoryGraphStore, MemoryStore, Node, NodeContent, SharedCoordinationStore,
};

fn service() -> (dialectic::SharedLockService, std::sync::Arc<EventBus>) {
    let events = EventBus::new().shared();
    let store: SharedCoordinationStore = MemoryStore::new().shared();
    let locks = BranchLockService::new(store, LockConfig::default())
        .with_events(events.clone())
        .shared();
    (locks, events)
}

#[tokio::test]
async fn test_token_gates_graph_writes() {
    let (locks, _) = service();
    let graph = MemoryGraphStore::new();
    let (goal, main) = graph.create_session("s1", "decide").unwrap();
    let side = main.fork("side", &goal.id);
    graph.put_branch(side.clone()).unwrap();

    let meta = HolderMeta::agent("debater", "debater");
    let token = locks
        .acquire_agent_lock(&main.id, "debater-1", &meta, None)
        .await
        .unwrap();

    let on_main = Node::new("s1", NodeContent::claim("position"), 1)
        .with_branch(&main.id)
        .with_parent(&goal.id);
    assert!(graph.upsert_node(&token, on_main).is_ok());

    let on_side = Node::new("s1", NodeContent::claim("elsewhere"), 1).with_branch(&side.id);
    let err = graph.upsert_node(&token, on_side).unwrap_err();
    assert!(matches!(err, GraphError::BranchMismatch { .. }));

    assert!(locks.verify(&token).await.unwrap());
    assert!(locks.release(token).await.unwrap());
}

#[tokio::test]
async fn test_user_and_agent_exclusion() {
    let (locks, _) = service();
    let meta = HolderMeta::agent("generator", "generator");

    let agent = locks.acquire_agent_lock("b1", "gen-1", &meta, None).await.unwrap();
    assert!(!locks.check_user_can_edit("b1", "alice").await.unwrap());
    let err = locks.request_user_lock("b1", "alice", None).await.unwrap_err();
    assert!(err.is_contention());
    assert_eq!(locks.get_lock_state("b1").await.unwrap().state, LockState::Observation);

    locks.release(agent).await.unwrap();
    let user = locks.request_user_lock("b1", "alice", None).await.unwrap();
    assert_eq!(user.holder_kind(), HolderKind::User);
    assert_eq!(locks.get_lock_state("b1").await.unwrap().state, LockState::Editable);
    assert!(locks.check_user_can_edit("b1", "alice").await.unwrap());
    assert!(!locks.check_user_can_edit("b1", "bob").await.unwrap());
    assert!(locks
        .acquire_agent_lock("b1", "gen-2", &meta, None)
        .await
        .unwrap_err()
        .is_contention());
}

#[tokio::test(start_paused = true)]
async fn test_crashed_holder_expires() {
    let (locks, _) = service();
    let meta = HolderMeta::agent("debater", "debater");
    let _lost = locks
        .acquire_agent_lock("b1", "crashed", &meta, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(6)).await;
    let token = locks.acquire_agent_lock("b1", "fresh", &meta, None).await.unwrap();
    assert_eq!(token.holder_id(), "fresh");
}

#[tokio::test]
async fn test_global_pause_is_observable() {
    let (locks, events) = service();
    let mut rx = events.subscribe();
    let mut interrupts = locks.subscribe_interrupts("s1").await.unwrap();
    for b in ["b1", "b2", "b3"] {
        locks.register_branch_for_session("s1", b).await.unwrap();
    }
    let meta = HolderMeta::agent("debater", "debater");
    let held = locks.acquire_agent_lock("b2", "debater-1", &meta, None).await.unwrap();

    assert_eq!(locks.trigger_global_interrupt("s1", "operator").await.unwrap(), 3);
    assert!(interrupts.try_recv().is_ok());
    assert!(!locks.verify(&held).await.unwrap());
    assert!(!locks.release(held).await.unwrap());

    let mut paused = 0;
    let mut interrupt_seen = false;
    while let Ok(envelope) = rx.try_recv() {
        match envelope.event {
            EngineEvent::LockChanged { state: LockState::Paused, .. } => paused += 1,
            EngineEvent::GlobalInterrupt { branches_paused, .. } => {
                assert_eq!(branches_paused, 3);
                interrupt_seen = true;
            }
            _ => {}
        }
    }
    assert_eq!(paused, 3);
    assert!(interrupt_seen);

    assert_eq!(locks.clear_global_pause("s1", "operator").await.unwrap(), 3);
    assert_eq!(locks.get_lock_state("b2").await.unwrap().state, LockState::Editable);
}
