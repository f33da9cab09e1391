use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::collab::{CollaborationOutcome, CollaborationRequest};
use crate::event::{Event, EventBuilder, EventKind};
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::store::{LearningPattern, SharedStateStore};
use crate::Mesh;

/// Handle given to behavior hooks; everything an agent may touch goes through
/// the mesh API exposed here.
#[derive(Clone)]
pub struct AgentContext {
    descriptor: AgentDescriptor,
    mesh: Arc<Mesh>,
}

impl AgentContext {
    pub(crate) fn new(descriptor: AgentDescriptor, mesh: Arc<Mesh>) -> Self {
        Self { descriptor, mesh }
    }

    pub fn agent_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn agent_type(&self) -> &str {
        &self.descriptor.agent_type
    }

    pub fn store(&self) -> &SharedStateStore {
        self.mesh.store()
    }

    pub fn registry(&self) -> &AgentRegistry {
        self.mesh.registry()
    }

    /// Builder pre-filled with this agent as the source
    pub fn event(&self, kind: EventKind) -> EventBuilder {
        Event::builder(kind, self.agent_id(), self.agent_type())
    }

    pub fn publish(&self, event: Event) -> usize {
        self.mesh.bus().publish(event)
    }

    pub fn reply(&self, request: &Event, payload: Value) -> usize {
        self.mesh
            .bus()
            .reply(request, self.agent_id(), self.agent_type(), payload)
    }

    pub async fn request_collaboration(
        &self,
        capability: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> CollaborationOutcome {
        let mut request = CollaborationRequest::new(self.agent_id(), self.agent_type(), capability)
            .payload(payload);
        request.timeout = timeout;
        self.mesh.request_collaboration(request).await
    }

    /// Record a learning pattern and announce it to every other agent
    pub fn share_pattern(&self, key: &str, payload: Value) -> LearningPattern {
        let pattern = self
            .store()
            .record_pattern(key, payload, self.agent_type());
        let evt = self
            .event(EventKind::PatternLearned)
            .payload(serde_json::to_value(&pattern).unwrap_or_default())
            .meta("pattern_key", key)
            .build();
        self.publish(evt);
        pattern
    }
}
