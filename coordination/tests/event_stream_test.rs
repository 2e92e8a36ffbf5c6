//! Event stream of a full run: ordering, replay and resume.

use dialectic::{EngineConfig, EngineEvent, Phase, PhaseOrchestrator, SessionRequest};

#[tokio::test]
async fn test_replay_reconstructs_run() {
    let engine = PhaseOrchestrator::in_memory(EngineConfig::default());
    let outcome = engine
        .run(SessionRequest::new("pick a deployment region").with_constraint("must keep data in the EU"))
        .await
        .unwrap();

    let events = engine.events().replay_since(engine.session_id(), 0).unwrap();
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[1].id == w[0].id + 1));

    let phases: Vec<Phase> = events
        .iter()
        .filter_map(|e| match e.event {
            EngineEvent::PhaseChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    let expected: Vec<Phase> = outcome.transitions.iter().map(|t| t.to).collect();
    assert_eq!(phases, expected);

    // Every node the graph holds was announced.
    let snapshot = engine.graph().snapshot(engine.session_id()).unwrap();
    let announced = events.iter().filter(|e| e.event_type() == "node_created").count();
    assert_eq!(announced, snapshot.nodes.len());

    let triggers: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            EngineEvent::ConvergenceTriggered { trigger, .. } => Some(trigger.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(triggers, vec![outcome.output.trigger.clone()]);
}

#[tokio::test]
async fn test_resume_after_last_seen_id() {
    let engine = PhaseOrchestrator::in_memory(EngineConfig::default());
    engine.run(SessionRequest::new("name the service")).await.unwrap();

    let all = engine.events().replay_since(engine.session_id(), 0).unwrap();
    let midpoint = all[all.len() / 2].id;
    let mut stream = engine.events().resume(engine.session_id(), midpoint).unwrap();

    let first = stream.recv().await.unwrap();
    assert_eq!(first.id, midpoint + 1);
    let frame = first.to_sse();
    assert!(frame.starts_with(&format!("id: {}\n", first.id)));
    assert!(frame.contains(&format!("event: {}\n", first.event_type())));
}
