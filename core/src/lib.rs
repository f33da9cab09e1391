// Conclave Core Library
// Capability-routed coordination mesh for long-lived agents

pub mod agent;
pub mod collab;
pub mod config;
pub mod event;
pub mod registry;
pub mod store;
pub mod telemetry;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

// Export core types
pub use agent::{Agent, AgentBehavior, AgentContext, LifecycleState};
pub use collab::{reply_to, CollaborationOutcome, CollaborationRequest};
pub use config::MeshConfig;
pub use event::{keys, BusSnapshot, Event, EventBuilder, EventBus, EventHandler, EventKind};
pub use registry::{
    AgentDescriptor, AgentProfile, AgentRegistry, CollaborationRecord, CollaborationSession,
    SessionMessage, SessionStatus,
};
pub use store::{LearningPattern, Lookup, SharedStateStore, StateChange};
pub use telemetry::MeshMetrics;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Event bus error: {0}")]
    EventBusError(String),

    #[error("Agent error: {0}")]
    AgentError(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Unknown collaboration session: {0}")]
    UnknownSession(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, MeshError>;

/// Diagnostic snapshot of the whole mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSnapshot {
    pub active_agents: usize,
    pub total_agents: usize,
    pub active_sessions: usize,
    pub shared_entry_count: usize,
    pub learning_pattern_count: usize,
    pub last_update: DateTime<Utc>,
    pub bus: BusSnapshot,
}

/// Outcome of activating a batch of agents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub activated: Vec<String>,
    /// (agent id, error message)
    pub failed: Vec<(String, String)>,
}

impl BootstrapReport {
    pub fn all_activated(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Coordinator owning the shared state store, the agent registry and the event bus
pub struct Mesh {
    config: MeshConfig,
    store: Arc<SharedStateStore>,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    metrics: MeshMetrics,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Mesh {
    pub async fn new(config: MeshConfig) -> Result<Arc<Self>> {
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&registry), config.clone()).await?);
        Ok(Arc::new(Self {
            store: Arc::new(SharedStateStore::new(config.default_ttl)),
            registry,
            bus,
            metrics: MeshMetrics::new(),
            sweeper: Mutex::new(None),
            config,
        }))
    }

    pub async fn start(&self) -> Result<()> {
        info!("Starting Conclave mesh...");
        self.bus.start().await?;
        if let Some(interval) = self.config.sweep_interval {
            let handle = self.store.spawn_sweeper(interval);
            if let Ok(mut slot) = self.sweeper.lock() {
                if let Some(previous) = slot.replace(handle) {
                    previous.abort();
                }
            }
        }
        info!("Conclave mesh started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down Conclave mesh...");
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.bus.shutdown().await?;
        info!("Conclave mesh shut down");
        Ok(())
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register an agent: upsert its profile, replace its routing capabilities,
    /// subscribe its handler and announce it to every other active agent.
    pub fn register(
        &self,
        descriptor: &AgentDescriptor,
        handler: Arc<dyn EventHandler>,
    ) -> AgentProfile {
        if let Some(previous) = self.registry.profile(&descriptor.agent_type) {
            if previous.active && previous.agent_id != descriptor.id {
                warn!(
                    agent_type = %descriptor.agent_type,
                    previous_id = %previous.agent_id,
                    agent_id = %descriptor.id,
                    "agent type re-registered by a different agent; replacing"
                );
                self.bus.unsubscribe(&previous.agent_id);
                self.metrics.agents_active.add(-1, &[]);
            }
        }

        let profile = self.registry.register(descriptor);
        self.bus
            .register_capabilities(&descriptor.agent_type, descriptor.capabilities.iter().cloned());
        self.bus
            .subscribe(descriptor.id.clone(), descriptor.agent_type.clone(), handler);

        self.metrics.agents_active.add(1, &[]);
        self.metrics.agents_registered.add(1, &[]);

        let announcement = Event::builder(
            EventKind::AgentRegistered,
            descriptor.id.clone(),
            descriptor.agent_type.clone(),
        )
        .payload(serde_json::to_value(&profile).unwrap_or_default())
        .meta(keys::AGENT_TYPE, descriptor.agent_type.clone())
        .build();
        self.bus.publish(announcement);

        profile
    }

    /// Remove an agent from routing and mark its profile inactive. Unknown or
    /// already unregistered agents are a no-op; returns whether anything changed.
    pub fn unregister(&self, descriptor: &AgentDescriptor) -> bool {
        let was_subscribed = self.bus.unsubscribe(&descriptor.id);

        let owns_profile = self
            .registry
            .profile(&descriptor.agent_type)
            .map(|p| p.agent_id == descriptor.id)
            .unwrap_or(false);
        if !owns_profile {
            return was_subscribed;
        }
        if !self.registry.unregister(&descriptor.agent_type) {
            return was_subscribed;
        }

        self.bus.remove_capabilities(&descriptor.agent_type);
        self.metrics.agents_active.add(-1, &[]);
        self.metrics.agents_unregistered.add(1, &[]);

        let announcement = Event::builder(
            EventKind::AgentUnregistered,
            descriptor.id.clone(),
            descriptor.agent_type.clone(),
        )
        .meta(keys::AGENT_TYPE, descriptor.agent_type.clone())
        .build();
        self.bus.publish(announcement);
        true
    }

    /// Scatter-gather over the bus, counted in the mesh metrics
    pub async fn request_collaboration(&self, request: CollaborationRequest) -> CollaborationOutcome {
        self.metrics.collaborations.add(1, &[]);
        self.bus.request_collaboration(request).await
    }

    /// Initialize every agent, continuing past individual failures
    pub async fn activate_all(&self, agents: &[Arc<Agent>]) -> BootstrapReport {
        let mut report = BootstrapReport::default();
        for agent in agents {
            match agent.initialize().await {
                Ok(()) => report.activated.push(agent.id().to_string()),
                Err(e) => {
                    warn!(agent_id = %agent.id(), error = %e, "agent failed to activate; continuing bootstrap");
                    report.failed.push((agent.id().to_string(), e.to_string()));
                }
            }
        }
        info!(
            activated = report.activated.len(),
            failed = report.failed.len(),
            "bootstrap finished"
        );
        report
    }

    /// Shut down every agent; one agent's failure never blocks the rest
    pub async fn shutdown_all(&self, agents: &[Arc<Agent>]) {
        for agent in agents {
            agent.shutdown().await;
        }
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        let store_update = self.store.last_update();
        let last_update = match self.registry.last_update() {
            Some(registry_update) if registry_update > store_update => registry_update,
            _ => store_update,
        };
        MeshSnapshot {
            active_agents: self.registry.active_count(),
            total_agents: self.registry.total_count(),
            active_sessions: self.registry.active_session_count(),
            shared_entry_count: self.store.len(),
            learning_pattern_count: self.store.pattern_count(),
            last_update,
            bus: self.bus.stats(),
        }
    }
}
