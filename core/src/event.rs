// Event types and the capability-routed event bus
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

use crate::collab::PendingGather;
use crate::config::MeshConfig;
use crate::registry::AgentRegistry;
use crate::store::panic_message;
use crate::{MeshError, Result};

/// Reserved metadata keys
pub mod keys {
    /// Links a collaboration reply to its request
    pub const CORRELATION_ID: &str = "correlation_id";
    /// Agent id the reply should be addressed to
    pub const REPLY_TO: &str = "reply_to";
    /// Capability or topic a collaboration request was issued for
    pub const TOPIC: &str = "topic";
    /// Collaboration session opened for a directed request
    pub const SESSION_ID: &str = "session_id";
    /// Agent type of a registered/unregistered peer
    pub const AGENT_TYPE: &str = "agent_type";
}

/// Closed set of event kinds understood by the mesh.
///
/// `Custom` carries kinds introduced by newer peers; agents that do not know a
/// custom kind ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AgentRegistered,
    AgentUnregistered,
    CollaborationRequest,
    CollaborationReply,
    StateChanged,
    PatternLearned,
    SystemSignal,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::AgentRegistered => "AGENT_REGISTERED",
            EventKind::AgentUnregistered => "AGENT_UNREGISTERED",
            EventKind::CollaborationRequest => "COLLABORATION_REQUEST",
            EventKind::CollaborationReply => "COLLABORATION_REPLY",
            EventKind::StateChanged => "STATE_CHANGED",
            EventKind::PatternLearned => "PATTERN_LEARNED",
            EventKind::SystemSignal => "SYSTEM_SIGNAL",
            EventKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable event exchanged between agents. Build with [`Event::builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: String,
    kind: EventKind,
    source_id: String,
    source_type: String,
    target_id: Option<String>,
    required_capabilities: BTreeSet<String>,
    payload: Value,
    metadata: HashMap<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Event {
    pub fn builder(
        kind: EventKind,
        source_id: impl Into<String>,
        source_type: impl Into<String>,
    ) -> EventBuilder {
        EventBuilder {
            kind,
            source_id: source_id.into(),
            source_type: source_type.into(),
            target_id: None,
            required_capabilities: BTreeSet::new(),
            payload: Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    pub fn required_capabilities(&self) -> &BTreeSet<String> {
        &self.required_capabilities
    }

    /// Whether routing should consider capabilities rather than broadcast
    pub fn is_capability_routed(&self) -> bool {
        !self.required_capabilities.is_empty()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.meta_str(keys::CORRELATION_ID)
    }
}

pub struct EventBuilder {
    kind: EventKind,
    source_id: String,
    source_type: String,
    target_id: Option<String>,
    required_capabilities: BTreeSet<String>,
    payload: Value,
    metadata: HashMap<String, Value>,
}

impl EventBuilder {
    pub fn target(mut self, agent_id: impl Into<String>) -> Self {
        self.target_id = Some(agent_id.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Event {
        Event {
            id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            kind: self.kind,
            source_id: self.source_id,
            source_type: self.source_type,
            target_id: self.target_id,
            required_capabilities: self.required_capabilities,
            payload: self.payload,
            metadata: self.metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Event handler trait
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

/// A handler subscribed on behalf of one agent
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub(crate) agent_id: String,
    pub(crate) agent_type: String,
    pub(crate) handler: Arc<dyn EventHandler>,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Read-only bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub total_subscribers: usize,
    pub capability_map_size: usize,
    pub total_published: u64,
    pub total_delivered: u64,
    pub failed_deliveries: u64,
    pub dropped_events: u64,
    pub pending_collaborations: usize,
}

/// Capability-routed event bus.
///
/// `publish` never waits on recipients: each delivery runs as its own task and
/// a shared semaphore bounds how many handlers run at once. Map guards are
/// released before any handler is spawned.
pub struct EventBus {
    // agent_id -> subscriber
    subscribers: DashMap<String, Subscriber>,
    // agent_type -> capabilities used for routing
    capability_map: DashMap<String, BTreeSet<String>>,
    // correlation_id -> in-flight scatter-gather
    pub(crate) pending: DashMap<String, PendingGather>,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) config: MeshConfig,
    workers: Arc<Semaphore>,
    runtime: Handle,
    counters: Arc<BusCounters>,
}

impl EventBus {
    /// Deliveries are spawned on the tokio runtime this is called from.
    pub async fn new(registry: Arc<AgentRegistry>, config: MeshConfig) -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|e| MeshError::EventBusError(e.to_string()))?;
        let workers = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));
        Ok(Self {
            subscribers: DashMap::new(),
            capability_map: DashMap::new(),
            pending: DashMap::new(),
            registry,
            config,
            workers,
            runtime,
            counters: Arc::new(BusCounters::default()),
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!("Event Bus started");
        Ok(())
    }

    /// Drop all subscriptions and abandon pending gathers; in-flight deliveries
    /// finish on their own clones.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Event Bus shutting down");
        self.subscribers.clear();
        self.pending.clear();
        Ok(())
    }

    pub fn subscribe(
        &self,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let agent_id = agent_id.into();
        let agent_type = agent_type.into();
        debug!(agent_id = %agent_id, agent_type = %agent_type, "subscriber added");
        self.subscribers.insert(
            agent_id.clone(),
            Subscriber {
                agent_id,
                agent_type,
                handler,
            },
        );
    }

    pub fn unsubscribe(&self, agent_id: &str) -> bool {
        let removed = self.subscribers.remove(agent_id).is_some();
        if removed {
            debug!(agent_id = %agent_id, "subscriber removed");
        }
        removed
    }

    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.subscribers.contains_key(agent_id)
    }

    /// Replace the routing capabilities of `agent_type`
    pub fn register_capabilities<I, S>(&self, agent_type: &str, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let caps: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        debug!(agent_type = %agent_type, capabilities = ?caps, "routing capabilities replaced");
        self.capability_map.insert(agent_type.to_string(), caps);
    }

    pub fn remove_capabilities(&self, agent_type: &str) {
        self.capability_map.remove(agent_type);
    }

    pub fn capabilities_of(&self, agent_type: &str) -> Option<BTreeSet<String>> {
        self.capability_map.get(agent_type).map(|c| c.clone())
    }

    /// Publish without waiting for delivery. Returns the number of deliveries
    /// scheduled (or 1 when a reply was handed to a pending collaboration).
    pub fn publish(&self, event: Event) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        trace!(event_id = %event.id, kind = %event.kind, source = %event.source_id, "publishing event");

        if event.kind == EventKind::CollaborationReply {
            if let Some(corr) = event.correlation_id().map(str::to_owned) {
                return usize::from(self.route_reply(&corr, event));
            }
        }

        let targets = self.resolve_targets(&event);
        if targets.is_empty() {
            debug!(event_id = %event.id, kind = %event.kind, "no recipients for event");
            return 0;
        }

        let count = targets.len();
        for sub in targets {
            self.dispatch(sub, event.clone());
        }
        count
    }

    /// Snapshot of the bus for diagnostics
    pub fn stats(&self) -> BusSnapshot {
        BusSnapshot {
            total_subscribers: self.subscribers.len(),
            capability_map_size: self.capability_map.len(),
            total_published: self.counters.published.load(Ordering::Relaxed),
            total_delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed.load(Ordering::Relaxed),
            dropped_events: self.counters.dropped.load(Ordering::Relaxed),
            pending_collaborations: self.pending.len(),
        }
    }

    pub(crate) fn subscriber_of_type(&self, agent_type: &str) -> Option<Subscriber> {
        self.subscribers
            .iter()
            .find(|s| s.agent_type == agent_type)
            .map(|s| s.clone())
    }

    pub(crate) fn count_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn resolve_targets(&self, event: &Event) -> Vec<Subscriber> {
        if let Some(target) = event.target_id() {
            return match self.subscribers.get(target).map(|s| s.clone()) {
                Some(sub) if self.registry.is_active(&sub.agent_type) => vec![sub],
                _ => {
                    warn!(event_id = %event.id, kind = %event.kind, target = %target, "target agent not found or inactive; dropping event");
                    self.count_dropped();
                    Vec::new()
                }
            };
        }

        let candidates: Vec<Subscriber> = self
            .subscribers
            .iter()
            .filter(|s| s.agent_id != event.source_id)
            .map(|s| s.clone())
            .collect();

        candidates
            .into_iter()
            .filter(|s| self.registry.is_active(&s.agent_type))
            .filter(|s| {
                !event.is_capability_routed()
                    || self
                        .capability_map
                        .get(&s.agent_type)
                        .map(|caps| !caps.is_disjoint(&event.required_capabilities))
                        .unwrap_or(false)
            })
            .collect()
    }

    fn dispatch(&self, sub: Subscriber, event: Event) {
        let workers = Arc::clone(&self.workers);
        let counters = Arc::clone(&self.counters);
        // Collaboration requests skip the pool: the handlers waiting on their
        // replies may hold every permit.
        let pooled = event.kind != EventKind::CollaborationRequest;
        self.runtime.spawn(async move {
            let _permit = if pooled {
                match workers.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            } else {
                None
            };
            let event_id = event.id.clone();
            let kind = event.kind.clone();

            match AssertUnwindSafe(sub.handler.handle(event))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(agent_id = %sub.agent_id, event_id = %event_id, kind = %kind, error = %e, "handler failed");
                }
                Err(panic) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(agent_id = %sub.agent_id, event_id = %event_id, kind = %kind, reason = %panic_message(&panic), "handler panicked");
                }
            }
        });
    }
}
