use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::behavior::AgentBehavior;
use super::context::AgentContext;
use crate::registry::AgentDescriptor;
use crate::store::panic_message;
use crate::{Event, EventHandler, EventKind, Mesh, MeshError, Result};

/// Lifecycle of an agent. `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Uninitialized,
    Active,
    ShutDown,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LifecycleState::Active,
            2 => LifecycleState::ShutDown,
            _ => LifecycleState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Uninitialized => 0,
            LifecycleState::Active => 1,
            LifecycleState::ShutDown => 2,
        }
    }
}

/// Agent instance: a behavior wrapped in the mesh lifecycle
pub struct Agent {
    descriptor: AgentDescriptor,
    state: AtomicU8,
    behavior: Box<dyn AgentBehavior>,
    // serializes initialize/shutdown
    lifecycle: Mutex<()>,
    mesh: Arc<Mesh>,
}

impl Agent {
    pub fn new(
        descriptor: AgentDescriptor,
        behavior: impl AgentBehavior + 'static,
        mesh: Arc<Mesh>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            state: AtomicU8::new(LifecycleState::Uninitialized.as_u8()),
            behavior: Box::new(behavior),
            lifecycle: Mutex::new(()),
            mesh,
        })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn agent_type(&self) -> &str {
        &self.descriptor.agent_type
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.descriptor.capabilities
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// Run setup, become Active, then register with the mesh.
    ///
    /// Only valid from `Uninitialized`. A failing setup leaves the agent
    /// unregistered and `Uninitialized`.
    #[tracing::instrument(skip(self), fields(agent_id = %self.descriptor.id, agent_type = %self.descriptor.agent_type))]
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let current = self.state();
        if current != LifecycleState::Uninitialized {
            return Err(MeshError::InvalidTransition(format!(
                "agent {} cannot initialize from {:?}",
                self.descriptor.id, current
            )));
        }

        let ctx = self.context();
        match AssertUnwindSafe(self.behavior.on_init(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "agent setup failed");
                return Err(e);
            }
            Err(panic) => {
                let reason = panic_message(&panic);
                warn!(reason = %reason, "agent setup panicked");
                return Err(MeshError::AgentError(format!(
                    "agent {} setup panicked: {}",
                    self.descriptor.id, reason
                )));
            }
        }

        // deliveries check the state, so it must be Active before subscribing
        self.set_state(LifecycleState::Active);
        let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
        self.mesh.register(&self.descriptor, handler);
        info!("Agent {} active", self.descriptor.id);
        Ok(())
    }

    /// Leave the mesh, run teardown, become ShutDown. Idempotent; failures are
    /// logged and never returned.
    #[tracing::instrument(skip(self), fields(agent_id = %self.descriptor.id, agent_type = %self.descriptor.agent_type))]
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let previous = self.state();
        match previous {
            LifecycleState::ShutDown => {
                debug!("agent already shut down");
                return;
            }
            LifecycleState::Uninitialized => {
                self.set_state(LifecycleState::ShutDown);
                debug!("agent shut down before initialization");
                return;
            }
            LifecycleState::Active => {}
        }

        self.mesh.unregister(&self.descriptor);

        let ctx = self.context();
        match AssertUnwindSafe(self.behavior.on_shutdown(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "agent teardown failed"),
            Err(panic) => error!(reason = %panic_message(&panic), "agent teardown panicked"),
        }

        self.set_state(LifecycleState::ShutDown);
        info!("Agent {} stopped", self.descriptor.id);
    }

    /// Dispatch on the event kind to the matching behavior hook.
    ///
    /// Hooks run concurrently; an agent waiting on a collaboration from one
    /// hook still answers requests in another.
    pub async fn handle_event(&self, event: Event) -> Result<()> {
        let state = self.state();
        if state != LifecycleState::Active {
            debug!(agent_id = %self.descriptor.id, event_id = %event.id(), state = ?state, "event for inactive agent dropped");
            return Ok(());
        }

        let ctx = self.context();
        let behavior = &self.behavior;
        match event.kind() {
            EventKind::AgentRegistered => behavior.on_agent_registered(&ctx, &event).await,
            EventKind::AgentUnregistered => behavior.on_agent_unregistered(&ctx, &event).await,
            EventKind::CollaborationRequest => {
                let reply = behavior.on_collaboration_request(&ctx, &event).await?;
                if let Some(payload) = reply {
                    ctx.reply(&event, payload);
                }
                Ok(())
            }
            EventKind::CollaborationReply => behavior.on_collaboration_reply(&ctx, &event).await,
            EventKind::StateChanged => behavior.on_state_changed(&ctx, &event).await,
            EventKind::PatternLearned => behavior.on_pattern_learned(&ctx, &event).await,
            EventKind::SystemSignal => behavior.on_signal(&ctx, &event).await,
            EventKind::Custom(name) => behavior.on_custom(&ctx, name, &event).await,
        }
    }

    fn context(&self) -> AgentContext {
        AgentContext::new(self.descriptor.clone(), Arc::clone(&self.mesh))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

#[async_trait]
impl EventHandler for Agent {
    async fn handle(&self, event: Event) -> Result<()> {
        self.handle_event(event).await
    }
}
