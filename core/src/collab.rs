use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::event::{keys, Event, EventBus, EventKind};

/// In-flight scatter-gather waiting for correlated replies
pub(crate) struct PendingGather {
    tx: mpsc::UnboundedSender<Event>,
    expected: HashSet<String>, // agent ids allowed to answer
}

/// Parameters of a scatter-gather request.
///
/// # Examples
///
/// ```no_run
/// use conclave_core::{CollaborationRequest, Mesh, MeshConfig};
/// use std::time::Duration;
///
/// # async fn example() -> conclave_core::Result<()> {
/// let mesh = Mesh::new(MeshConfig::default()).await?;
/// let outcome = mesh
///     .bus()
///     .request_collaboration(
///         CollaborationRequest::new("bridge-1", "SYSTEM_BRIDGE", "TROUBLESHOOTING")
///             .payload(serde_json::json!({"error": "disk full"}))
///             .timeout(Duration::from_secs(2)),
///     )
///     .await;
/// println!("{} of {} replied", outcome.replies.len(), outcome.targets.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CollaborationRequest {
    pub initiator_id: String,
    pub initiator_type: String,
    pub capability: String,
    pub payload: Value,
    /// Falls back to `MeshConfig::collaboration_timeout`
    pub timeout: Option<Duration>,
}

impl CollaborationRequest {
    pub fn new(
        initiator_id: impl Into<String>,
        initiator_type: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            initiator_id: initiator_id.into(),
            initiator_type: initiator_type.into(),
            capability: capability.into(),
            payload: Value::Null,
            timeout: None,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a scatter-gather collected before every target answered or the
/// deadline passed. A short reply list is a normal result, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationOutcome {
    pub correlation_id: String,
    pub capability: String,
    /// Agent types the request was sent to
    pub targets: Vec<String>,
    /// Replies in arrival order, at most one per target
    pub replies: Vec<Event>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CollaborationOutcome {
    fn empty(correlation_id: String, capability: String) -> Self {
        Self {
            correlation_id,
            capability,
            targets: Vec::new(),
            replies: Vec::new(),
            timed_out: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.replies.len() == self.targets.len()
    }

    /// Agent types that answered
    pub fn responders(&self) -> Vec<String> {
        self.replies
            .iter()
            .map(|r| r.source_type().to_string())
            .collect()
    }
}

/// Build a `CollaborationReply` correlated with `request`
pub fn reply_to(
    request: &Event,
    responder_id: impl Into<String>,
    responder_type: impl Into<String>,
    payload: Value,
) -> Event {
    let target = request
        .meta_str(keys::REPLY_TO)
        .unwrap_or_else(|| request.source_id())
        .to_string();
    let mut builder = Event::builder(EventKind::CollaborationReply, responder_id, responder_type)
        .target(target)
        .payload(payload);
    for key in [keys::CORRELATION_ID, keys::SESSION_ID, keys::TOPIC] {
        if let Some(v) = request.meta(key) {
            builder = builder.meta(key, v.clone());
        }
    }
    builder.build()
}

impl EventBus {
    /// Fan a request out to every active agent declaring `request.capability`
    /// and gather correlated replies until all targets answered or the deadline
    /// passes.
    ///
    /// Zero matching agents resolves immediately with an empty outcome. Replies
    /// arriving after the deadline are discarded. Each target gets a
    /// collaboration session, completed when it answers and terminated when it
    /// stays silent.
    #[tracing::instrument(skip(self, request), fields(initiator = %request.initiator_id, capability = %request.capability))]
    pub async fn request_collaboration(&self, request: CollaborationRequest) -> CollaborationOutcome {
        let started = Instant::now();
        let deadline = started + request.timeout.unwrap_or(self.config.collaboration_timeout);
        let correlation_id = format!("collab_{}", uuid::Uuid::new_v4().simple());

        let targets: Vec<_> = self
            .registry
            .find_by_capability(&request.capability)
            .into_iter()
            .filter(|t| *t != request.initiator_type)
            .filter_map(|t| self.subscriber_of_type(&t))
            .collect();

        if targets.is_empty() {
            info!("no agents offer capability; collaboration resolved empty");
            return CollaborationOutcome::empty(correlation_id, request.capability);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingGather {
                tx,
                expected: targets.iter().map(|t| t.agent_id.clone()).collect(),
            },
        );

        // agent_id -> session_id
        let mut sessions = Vec::with_capacity(targets.len());
        for target in &targets {
            let session_id = self.registry.start_collaboration_session(
                &request.initiator_type,
                &target.agent_type,
                &request.capability,
            );
            let evt = Event::builder(
                EventKind::CollaborationRequest,
                request.initiator_id.clone(),
                request.initiator_type.clone(),
            )
            .target(target.agent_id.clone())
            .payload(request.payload.clone())
            .meta(keys::CORRELATION_ID, correlation_id.clone())
            .meta(keys::REPLY_TO, request.initiator_id.clone())
            .meta(keys::TOPIC, request.capability.clone())
            .meta(keys::SESSION_ID, session_id.clone())
            .build();
            self.publish(evt);
            sessions.push((target.agent_id.clone(), session_id));
        }

        let mut replies: Vec<Event> = Vec::with_capacity(targets.len());
        let mut seen: HashSet<String> = HashSet::new();
        let mut timed_out = false;
        while replies.len() < targets.len() {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => {
                    if seen.insert(reply.source_id().to_string()) {
                        replies.push(reply);
                    } else {
                        debug!(responder = %reply.source_id(), "duplicate reply ignored");
                    }
                }
                // gather abandoned by bus shutdown
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }
        self.pending.remove(&correlation_id);

        for (agent_id, session_id) in &sessions {
            let result = if seen.contains(agent_id) {
                self.registry.complete_session(session_id)
            } else {
                self.registry.terminate_session(session_id)
            };
            if let Err(e) = result {
                // already closed, e.g. by the target unregistering
                debug!(session_id = %session_id, error = %e, "session left as is");
            }
        }

        let outcome = CollaborationOutcome {
            correlation_id,
            capability: request.capability,
            targets: targets.into_iter().map(|t| t.agent_type).collect(),
            replies,
            timed_out,
            elapsed: started.elapsed(),
        };
        if outcome.is_complete() {
            info!(replies = outcome.replies.len(), elapsed_ms = outcome.elapsed.as_millis() as u64, "collaboration complete");
        } else {
            warn!(
                replies = outcome.replies.len(),
                targets = outcome.targets.len(),
                timed_out,
                "collaboration resolved with partial replies"
            );
        }
        outcome
    }

    /// Publish a reply correlated with `request`
    pub fn reply(
        &self,
        request: &Event,
        responder_id: &str,
        responder_type: &str,
        payload: Value,
    ) -> usize {
        self.publish(reply_to(request, responder_id, responder_type, payload))
    }

    // Hands a correlated reply to its gather. Late or unexpected replies are dropped.
    pub(crate) fn route_reply(&self, correlation_id: &str, reply: Event) -> bool {
        let Some(gather) = self.pending.get(correlation_id) else {
            debug!(correlation_id = %correlation_id, responder = %reply.source_id(), "reply for closed collaboration discarded");
            self.count_dropped();
            return false;
        };
        if !gather.expected.contains(reply.source_id()) {
            debug!(correlation_id = %correlation_id, responder = %reply.source_id(), "reply from non-target discarded");
            self.count_dropped();
            return false;
        }
        gather.tx.send(reply).is_ok()
    }
}
