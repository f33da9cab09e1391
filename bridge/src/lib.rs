pub mod config;
pub mod signal;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conclave_core::{CollaborationOutcome, CollaborationRequest, Event, EventKind, Mesh, MeshError};

pub use config::BridgeConfig;
pub use signal::{HostSignal, Severity};

/// Agent id and type the bridge publishes under
pub const BRIDGE_ID: &str = "system-bridge";
pub const BRIDGE_TYPE: &str = "SYSTEM_BRIDGE";

/// Metadata keys attached to translated signals
pub mod meta {
    pub const SIGNAL_ID: &str = "signal_id";
    pub const CATEGORY: &str = "category";
    pub const SEVERITY: &str = "severity";
    pub const RISK_SCORE: &str = "risk_score";
    pub const REQUIRES_IMMEDIATE_ATTENTION: &str = "requires_immediate_attention";
    pub const SUGGESTED_COLLABORATION: &str = "suggested_collaboration";
}

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("bridge is not active")]
    Inactive,
    #[error("malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Optional reverse mapping from mesh events to host-visible signals
pub trait OutboundMapper: Send + Sync {
    fn to_host(&self, event: &Event) -> Option<HostSignal>;
}

/// Mapper used when no reverse translation is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMapper;

impl OutboundMapper for NoopMapper {
    fn to_host(&self, _event: &Event) -> Option<HostSignal> {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub active: bool,
    pub supported_categories: Vec<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub signals_processed: u64,
    pub escalations: u64,
}

/// What happened to one processed signal
#[derive(Debug, Clone)]
pub struct SignalReceipt {
    pub event_id: String,
    /// Deliveries scheduled by the publish
    pub recipients: usize,
    /// Present when the signal crossed the escalation threshold
    pub escalation: Option<CollaborationOutcome>,
}

/// Adapter between host subsystems and the mesh
pub struct SystemBridge {
    mesh: Arc<Mesh>,
    config: BridgeConfig,
    // category -> suggested capability
    routes: DashMap<String, String>,
    mapper: Box<dyn OutboundMapper>,
    active: AtomicBool,
    last_activity_ms: AtomicI64,
    processed: AtomicU64,
    escalations: AtomicU64,
}

impl SystemBridge {
    pub fn new(mesh: Arc<Mesh>, config: BridgeConfig) -> Self {
        let routes = config
            .routes
            .iter()
            .map(|(c, cap)| (c.clone(), cap.clone()))
            .collect();
        Self {
            mesh,
            config,
            routes,
            mapper: Box::new(NoopMapper),
            active: AtomicBool::new(true),
            last_activity_ms: AtomicI64::new(0),
            processed: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
        }
    }

    pub fn with_mapper(mut self, mapper: impl OutboundMapper + 'static) -> Self {
        self.mapper = Box::new(mapper);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Add or replace the capability hint for a category
    pub fn register_route(&self, category: &str, capability: impl Into<String>) {
        self.routes
            .insert(category.trim().to_ascii_uppercase(), capability.into());
    }

    pub fn suggested_collaboration(&self, signal: &HostSignal) -> Option<String> {
        self.routes
            .get(&signal.normalized_category())
            .map(|cap| cap.clone())
    }

    pub fn requires_escalation(&self, signal: &HostSignal) -> bool {
        signal.severity.map(Severity::is_urgent).unwrap_or(false)
            || signal
                .risk_score
                .map(|score| score > self.config.risk_threshold)
                .unwrap_or(false)
    }

    /// Convert a host signal into a `SystemSignal` event. A known category
    /// routes the event by capability; anything else is broadcast.
    pub fn translate(&self, signal: &HostSignal) -> Event {
        let hint = self.suggested_collaboration(signal);
        let mut builder = Event::builder(EventKind::SystemSignal, BRIDGE_ID, BRIDGE_TYPE)
            .payload(serde_json::to_value(signal).unwrap_or(Value::Null))
            .meta(meta::SIGNAL_ID, signal.id.clone())
            .meta(meta::CATEGORY, signal.normalized_category())
            .meta(
                meta::SEVERITY,
                signal
                    .severity
                    .map(|s| Value::from(s.as_str()))
                    .unwrap_or(Value::Null),
            )
            .meta(
                meta::RISK_SCORE,
                signal.risk_score.map(Value::from).unwrap_or(Value::Null),
            )
            .meta(
                meta::REQUIRES_IMMEDIATE_ATTENTION,
                self.requires_escalation(signal),
            );
        match hint {
            Some(capability) => {
                builder = builder
                    .meta(meta::SUGGESTED_COLLABORATION, capability.clone())
                    .capability(capability);
            }
            None => {
                debug!(signal_id = %signal.id, category = %signal.category, "unsupported category; broadcasting");
            }
        }
        builder.build()
    }

    /// Translate, publish and, when needed, escalate one signal.
    ///
    /// The escalation outcome is logged and returned; a timeout or an empty
    /// outcome is not an error.
    #[tracing::instrument(skip(self, signal), fields(signal_id = %signal.id, category = %signal.category))]
    pub async fn process(&self, signal: HostSignal) -> Result<SignalReceipt> {
        if !self.is_active() {
            return Err(BridgeError::Inactive);
        }
        if signal.id.trim().is_empty() || signal.category.trim().is_empty() {
            return Err(BridgeError::InvalidSignal(
                "signal id and category are required".to_string(),
            ));
        }
        self.touch();
        self.processed.fetch_add(1, Ordering::Relaxed);

        let event = self.translate(&signal);
        let event_id = event.id().to_string();
        let recipients = self.mesh.bus().publish(event);
        info!(event_id = %event_id, recipients, "host signal published");

        let escalation = if self.requires_escalation(&signal) {
            Some(self.escalate(&signal).await)
        } else {
            None
        };

        Ok(SignalReceipt {
            event_id,
            recipients,
            escalation,
        })
    }

    /// Process in the background so the host never waits on the mesh
    pub fn submit(self: &Arc<Self>, signal: HostSignal) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let signal_id = signal.id.clone();
            if let Err(e) = bridge.process(signal).await {
                error!(signal_id = %signal_id, error = %e, "failed to process host signal");
            }
        })
    }

    /// Parse one JSON-encoded signal
    pub fn parse_signal(raw: &str) -> Result<HostSignal> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reverse translation; `None` when the mapper has nothing for this event
    pub fn translate_outbound(&self, event: &Event) -> Option<HostSignal> {
        self.mapper.to_host(event)
    }

    pub fn status(&self) -> BridgeStatus {
        let mut supported_categories: Vec<String> =
            self.routes.iter().map(|r| r.key().clone()).collect();
        supported_categories.sort();
        BridgeStatus {
            active: self.is_active(),
            supported_categories,
            last_activity: match self.last_activity_ms.load(Ordering::Relaxed) {
                0 => None,
                ms => DateTime::from_timestamp_millis(ms),
            },
            signals_processed: self.processed.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
        info!("System bridge active");
    }

    /// Stop accepting signals; in-flight processing finishes
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        info!("System bridge inactive");
    }

    async fn escalate(&self, signal: &HostSignal) -> CollaborationOutcome {
        self.escalations.fetch_add(1, Ordering::Relaxed);
        let capability = self
            .suggested_collaboration(signal)
            .unwrap_or_else(|| self.config.fallback_capability.clone());
        let request = CollaborationRequest::new(BRIDGE_ID, BRIDGE_TYPE, capability)
            .payload(json!({
                "signal": signal,
                "urgency": "HIGH",
            }))
            .timeout(self.config.escalation_timeout);

        let outcome = self.mesh.request_collaboration(request).await;
        if outcome.replies.is_empty() {
            warn!(
                capability = %outcome.capability,
                targets = outcome.targets.len(),
                timed_out = outcome.timed_out,
                "escalation got no responses"
            );
        } else {
            info!(
                capability = %outcome.capability,
                replies = outcome.replies.len(),
                targets = outcome.targets.len(),
                responders = ?outcome.responders(),
                "escalation resolved"
            );
        }
        outcome
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}
