mod common;

use std::time::Duration;

use async_trait::async_trait;
use common::{mesh, BrokenSetup, KindLog, Responder, Silent};
use conclave_core::{
    Agent, AgentBehavior, AgentContext, AgentDescriptor, Event, EventKind, LifecycleState, Mesh,
    MeshConfig, MeshError, Result,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[tokio::test]
async fn initialize_then_shutdown() {
    let mesh = mesh().await;
    let agent = Agent::new(
        AgentDescriptor::new("risk-1", "RISK", ["risk-check"]),
        Silent,
        mesh.clone(),
    );
    assert_eq!(agent.state(), LifecycleState::Uninitialized);
    assert!(!mesh.registry().is_active("RISK"));

    agent.initialize().await.unwrap();
    assert_eq!(agent.state(), LifecycleState::Active);
    assert!(mesh.registry().is_active("RISK"));
    assert!(mesh.bus().is_subscribed("risk-1"));

    agent.shutdown().await;
    assert_eq!(agent.state(), LifecycleState::ShutDown);
    assert!(!mesh.registry().is_active("RISK"));
    assert!(!mesh.bus().is_subscribed("risk-1"));
}

#[tokio::test]
async fn second_initialize_is_rejected() {
    let mesh = mesh().await;
    let agent = Agent::new(AgentDescriptor::new("a", "A", ["x"]), Silent, mesh.clone());
    agent.initialize().await.unwrap();

    assert!(matches!(
        agent.initialize().await,
        Err(MeshError::InvalidTransition(_))
    ));
    assert_eq!(agent.state(), LifecycleState::Active);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let mesh = mesh().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agent = Agent::new(AgentDescriptor::new("a", "A", ["x"]), KindLog { tx }, mesh.clone());
    agent.initialize().await.unwrap();

    agent.shutdown().await;
    agent.shutdown().await;

    assert_eq!(rx.recv().await.as_deref(), Some("shutdown"));
    assert!(rx.try_recv().is_err());
    assert_eq!(agent.state(), LifecycleState::ShutDown);
}

#[tokio::test]
async fn shutdown_before_initialize_is_terminal() {
    let mesh = mesh().await;
    let agent = Agent::new(AgentDescriptor::new("a", "A", ["x"]), Silent, mesh.clone());

    agent.shutdown().await;
    assert_eq!(agent.state(), LifecycleState::ShutDown);
    assert!(matches!(
        agent.initialize().await,
        Err(MeshError::InvalidTransition(_))
    ));
    assert!(mesh.registry().profile("A").is_none());
}

#[tokio::test]
async fn failed_setup_leaves_agent_unregistered() {
    let mesh = mesh().await;
    let agent = Agent::new(AgentDescriptor::new("b", "BROKEN", ["x"]), BrokenSetup, mesh.clone());

    let err = agent.initialize().await.unwrap_err();
    assert!(err.to_string().contains("missing credentials"));
    assert_eq!(agent.state(), LifecycleState::Uninitialized);
    assert!(mesh.registry().profile("BROKEN").is_none());
    assert!(!mesh.bus().is_subscribed("b"));
}

#[tokio::test]
async fn bootstrap_continues_past_failures() {
    let mesh = mesh().await;
    let agents = vec![
        Agent::new(AgentDescriptor::new("ok-1", "OK1", ["x"]), Silent, mesh.clone()),
        Agent::new(AgentDescriptor::new("bad", "BAD", ["x"]), BrokenSetup, mesh.clone()),
        Agent::new(AgentDescriptor::new("ok-2", "OK2", ["x"]), Responder::immediate(), mesh.clone()),
    ];

    let report = mesh.activate_all(&agents).await;
    assert_eq!(report.activated, vec!["ok-1".to_string(), "ok-2".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "bad");
    assert!(!report.all_activated());
    assert_eq!(mesh.registry().active_count(), 2);

    mesh.shutdown_all(&agents).await;
    assert!(agents.iter().all(|a| a.state() == LifecycleState::ShutDown));
    assert_eq!(mesh.registry().active_count(), 0);
}

#[tokio::test]
async fn peers_are_announced_to_hooks() {
    let mesh = mesh().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = Agent::new(AgentDescriptor::new("w", "WATCHER", ["x"]), KindLog { tx }, mesh.clone());
    watcher.initialize().await.unwrap();

    let peer = Agent::new(AgentDescriptor::new("p", "PEER", ["y"]), Silent, mesh.clone());
    peer.initialize().await.unwrap();
    peer.shutdown().await;

    let mut seen = Vec::new();
    while seen.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(kind)) => seen.push(kind),
            _ => break,
        }
    }
    assert_eq!(seen, vec!["AGENT_REGISTERED", "AGENT_UNREGISTERED"]);
}

#[tokio::test]
async fn unknown_custom_kind_is_ignored() {
    let mesh = mesh().await;
    let agent = Agent::new(AgentDescriptor::new("a", "A", ["x"]), Silent, mesh.clone());
    agent.initialize().await.unwrap();

    let evt = Event::builder(EventKind::Custom("FROM_THE_FUTURE".into()), "ext", "EXTERNAL").build();
    assert!(agent.handle_event(evt).await.is_ok());
    assert_eq!(agent.state(), LifecycleState::Active);
}

#[tokio::test]
async fn events_after_shutdown_are_dropped() {
    let mesh = mesh().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agent = Agent::new(AgentDescriptor::new("a", "A", ["x"]), KindLog { tx }, mesh.clone());
    agent.initialize().await.unwrap();
    agent.shutdown().await;
    assert_eq!(rx.recv().await.as_deref(), Some("shutdown"));

    let evt = Event::builder(EventKind::SystemSignal, "ext", "EXTERNAL").build();
    assert!(agent.handle_event(evt).await.is_ok());
    assert!(rx.try_recv().is_err());
}

/// Asks its peers for a second opinion whenever a signal arrives
struct Escalator {
    tx: mpsc::UnboundedSender<usize>,
}

#[async_trait]
impl AgentBehavior for Escalator {
    async fn on_signal(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        let outcome = ctx
            .request_collaboration("review", event.payload().clone(), Some(Duration::from_secs(1)))
            .await;
        let _ = self.tx.send(outcome.replies.len());
        Ok(())
    }
}

#[tokio::test]
async fn agents_collaborate_through_their_context() {
    let mesh = mesh().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agents = vec![
        Agent::new(AgentDescriptor::new("esc", "ESCALATOR", ["triage"]), Escalator { tx }, mesh.clone()),
        Agent::new(AgentDescriptor::new("rev", "REVIEWER", ["review"]), Responder::immediate(), mesh.clone()),
    ];
    mesh.activate_all(&agents).await;

    let signal = Event::builder(EventKind::SystemSignal, "bridge", "SYSTEM_BRIDGE")
        .capability("triage")
        .payload(json!({"error": "disk full"}))
        .build();
    assert_eq!(mesh.bus().publish(signal), 1);

    let replies = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(replies, Some(1));
}

/// Shares a learned pattern during setup
struct Learner;

#[async_trait]
impl AgentBehavior for Learner {
    async fn on_init(&self, ctx: &AgentContext) -> Result<()> {
        ctx.share_pattern("retry-on-timeout", json!({"max_retries": 3}));
        Ok(())
    }
}

#[tokio::test]
async fn shared_patterns_show_up_in_snapshot() {
    let mesh = mesh().await;
    let agents = vec![
        Agent::new(AgentDescriptor::new("l", "LEARNER", ["x"]), Learner, mesh.clone()),
        Agent::new(AgentDescriptor::new("s", "SILENT", ["y"]), Silent, mesh.clone()),
    ];
    mesh.activate_all(&agents).await;
    mesh.store().set_default("regime", "RISK_OFF".to_string());

    let snap = mesh.snapshot();
    assert_eq!(snap.active_agents, 2);
    assert_eq!(snap.total_agents, 2);
    assert_eq!(snap.shared_entry_count, 1);
    assert_eq!(snap.learning_pattern_count, 1);
    assert_eq!(snap.active_sessions, 0);
    assert_eq!(
        mesh.store().peek_pattern("retry-on-timeout").unwrap().source_type,
        "LEARNER"
    );
}

#[tokio::test]
async fn events_before_initialize_are_dropped() {
    let mesh = mesh().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agent = Agent::new(AgentDescriptor::new("a", "A", ["x"]), KindLog { tx }, mesh.clone());

    let evt = Event::builder(EventKind::SystemSignal, "ext", "EXTERNAL").build();
    assert!(agent.handle_event(evt).await.is_ok());
    assert!(rx.try_recv().is_err());
    assert_eq!(agent.state(), LifecycleState::Uninitialized);
}

/// Asks `peer_capability` for help on every signal and answers every request
struct Mutual {
    peer_capability: &'static str,
    tx: mpsc::UnboundedSender<(String, usize)>,
}

#[async_trait]
impl AgentBehavior for Mutual {
    async fn on_signal(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        let outcome = ctx
            .request_collaboration(
                self.peer_capability,
                event.payload().clone(),
                Some(Duration::from_millis(300)),
            )
            .await;
        let _ = self.tx.send((ctx.agent_type().to_string(), outcome.replies.len()));
        Ok(())
    }

    async fn on_collaboration_request(
        &self,
        _ctx: &AgentContext,
        _event: &Event,
    ) -> Result<Option<Value>> {
        Ok(Some(json!({"ok": true})))
    }
}

#[tokio::test]
async fn agents_waiting_on_each_other_still_answer() {
    let mesh = mesh().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agents = vec![
        Agent::new(
            AgentDescriptor::new("a", "A", ["CAP_A"]),
            Mutual { peer_capability: "CAP_B", tx: tx.clone() },
            mesh.clone(),
        ),
        Agent::new(
            AgentDescriptor::new("b", "B", ["CAP_B"]),
            Mutual { peer_capability: "CAP_A", tx },
            mesh.clone(),
        ),
    ];
    assert!(mesh.activate_all(&agents).await.all_activated());

    let started = tokio::time::Instant::now();
    let signal = Event::builder(EventKind::SystemSignal, "ext", "EXTERNAL").build();
    assert_eq!(mesh.bus().publish(signal), 2);

    let mut results = Vec::new();
    for _ in 0..2 {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        results.push(got);
    }
    results.sort();
    assert_eq!(results, vec![("A".to_string(), 1), ("B".to_string(), 1)]);
    // both gathers resolved early instead of waiting out the deadline
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn gathering_handler_does_not_starve_its_targets() {
    let config = MeshConfig {
        max_concurrent_deliveries: 1,
        ..MeshConfig::default()
    };
    let mesh = Mesh::new(config).await.unwrap();
    mesh.start().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let agents = vec![
        Agent::new(AgentDescriptor::new("esc", "ESCALATOR", ["triage"]), Escalator { tx }, mesh.clone()),
        Agent::new(AgentDescriptor::new("rev", "REVIEWER", ["review"]), Responder::immediate(), mesh.clone()),
    ];
    assert!(mesh.activate_all(&agents).await.all_activated());

    let signal = Event::builder(EventKind::SystemSignal, "bridge", "SYSTEM_BRIDGE")
        .capability("triage")
        .build();
    assert_eq!(mesh.bus().publish(signal), 1);

    let replies = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(replies, Some(1));
}
