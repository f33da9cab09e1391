#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conclave_core::{
    AgentBehavior, AgentContext, Event, EventHandler, EventKind, Mesh, MeshConfig, MeshError,
    Result,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Handler that forwards every delivered event to a channel
pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: Event) -> Result<()> {
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Handler that panics on every event
pub struct Panicker;

#[async_trait]
impl EventHandler for Panicker {
    async fn handle(&self, _event: Event) -> Result<()> {
        panic!("handler exploded");
    }
}

/// Next event of `kind`, skipping anything else; `None` after one second
pub async fn next_of_kind(rx: &mut mpsc::UnboundedReceiver<Event>, kind: EventKind) -> Option<Event> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(evt)) if *evt.kind() == kind => return Some(evt),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

/// Whether an event of `kind` shows up within `wait`
pub async fn saw_kind(rx: &mut mpsc::UnboundedReceiver<Event>, kind: EventKind, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(evt)) if *evt.kind() == kind => return true,
            Ok(Some(_)) => continue,
            _ => return false,
        }
    }
}

/// Poll `check` until it holds or one second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn mesh() -> Arc<Mesh> {
    let mesh = Mesh::new(MeshConfig::default()).await.unwrap();
    mesh.start().await.unwrap();
    mesh
}

/// Answers collaboration requests with `{"from": <type>, "topic": ...}` after `delay`
pub struct Responder {
    pub delay: Duration,
}

impl Responder {
    pub fn immediate() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl AgentBehavior for Responder {
    async fn on_collaboration_request(
        &self,
        ctx: &AgentContext,
        event: &Event,
    ) -> Result<Option<Value>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Some(json!({
            "from": ctx.agent_type(),
            "topic": event.meta_str("topic"),
        })))
    }
}

/// Receives requests but never answers
pub struct Silent;

#[async_trait]
impl AgentBehavior for Silent {}

/// Setup that always fails
pub struct BrokenSetup;

#[async_trait]
impl AgentBehavior for BrokenSetup {
    async fn on_init(&self, _ctx: &AgentContext) -> Result<()> {
        Err(MeshError::AgentError("missing credentials".to_string()))
    }
}

/// Behavior that records the kind of every event reaching a hook
pub struct KindLog {
    pub tx: mpsc::UnboundedSender<String>,
}

impl KindLog {
    fn log(&self, event: &Event) {
        let _ = self.tx.send(event.kind().to_string());
    }
}

#[async_trait]
impl AgentBehavior for KindLog {
    async fn on_agent_registered(&self, _ctx: &AgentContext, event: &Event) -> Result<()> {
        self.log(event);
        Ok(())
    }

    async fn on_agent_unregistered(&self, _ctx: &AgentContext, event: &Event) -> Result<()> {
        self.log(event);
        Ok(())
    }

    async fn on_signal(&self, _ctx: &AgentContext, event: &Event) -> Result<()> {
        self.log(event);
        Ok(())
    }

    async fn on_shutdown(&self, _ctx: &AgentContext) -> Result<()> {
        let _ = self.tx.send("shutdown".to_string());
        Ok(())
    }
}
