use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{MeshError, Result};

/// Identity and self-declared capabilities of an agent, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
}

impl AgentDescriptor {
    pub fn new<I, S>(id: impl Into<String>, agent_type: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

/// One entry of an agent's collaboration history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationRecord {
    pub partner_type: String,
    pub purpose: String,
    pub timestamp: DateTime<Utc>,
}

/// Registry view of an agent type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub unregistered_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub history: Vec<CollaborationRecord>,
    #[serde(skip)]
    registration_seq: u64,
}

impl AgentProfile {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Terminated,
    Paused,
}

impl SessionStatus {
    /// Completed and Terminated sessions never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Terminated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub sender_type: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Tracked relationship between two agent types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationSession {
    pub id: String,
    pub initiator_type: String,
    pub target_type: String,
    pub purpose: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub messages: Vec<SessionMessage>,
}

impl CollaborationSession {
    pub fn involves(&self, agent_type: &str) -> bool {
        self.initiator_type == agent_type || self.target_type == agent_type
    }
}

/// In-memory registry of agent profiles and collaboration sessions.
///
/// Profiles are keyed by agent type; every accessor returns clones.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    profiles: DashMap<String, AgentProfile>, // agent_type -> profile
    sessions: DashMap<String, CollaborationSession>, // session_id -> session
    next_seq: AtomicU64,
    last_update_ms: AtomicI64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the profile for `descriptor.agent_type`; the previous profile of
    /// that type, history included, is replaced.
    #[tracing::instrument(skip(self, descriptor), fields(agent_id = %descriptor.id, agent_type = %descriptor.agent_type))]
    pub fn register(&self, descriptor: &AgentDescriptor) -> AgentProfile {
        let profile = AgentProfile {
            agent_id: descriptor.id.clone(),
            agent_type: descriptor.agent_type.clone(),
            capabilities: descriptor.capabilities.clone(),
            registered_at: Utc::now(),
            unregistered_at: None,
            active: true,
            history: Vec::new(),
            registration_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(old) = self
            .profiles
            .insert(descriptor.agent_type.clone(), profile.clone())
        {
            debug!(previous_id = %old.agent_id, "replaced existing profile");
        }
        self.touch();
        info!(capabilities = ?descriptor.capabilities, "agent profile registered");
        profile
    }

    /// Mark `agent_type` inactive and terminate its open sessions.
    ///
    /// Returns false (and changes nothing) for unknown or already inactive types.
    #[tracing::instrument(skip(self))]
    pub fn unregister(&self, agent_type: &str) -> bool {
        let now = Utc::now();
        {
            let Some(mut profile) = self.profiles.get_mut(agent_type) else {
                debug!("unregister of unknown agent type ignored");
                return false;
            };
            if !profile.active {
                debug!("agent type already inactive");
                return false;
            }
            profile.active = false;
            profile.unregistered_at = Some(now);
        }

        let mut terminated = 0usize;
        for mut session in self.sessions.iter_mut() {
            if session.involves(agent_type) && !session.status.is_terminal() {
                session.status = SessionStatus::Terminated;
                session.ended_at = Some(now);
                terminated += 1;
            }
        }
        self.touch();
        info!(terminated_sessions = terminated, "agent profile unregistered");
        true
    }

    pub fn profile(&self, agent_type: &str) -> Option<AgentProfile> {
        self.profiles.get(agent_type).map(|p| p.clone())
    }

    pub fn profiles(&self) -> Vec<AgentProfile> {
        let mut all: Vec<AgentProfile> = self.profiles.iter().map(|p| p.clone()).collect();
        all.sort_by_key(|p| p.registration_seq);
        all
    }

    pub fn is_active(&self, agent_type: &str) -> bool {
        self.profiles
            .get(agent_type)
            .map(|p| p.active)
            .unwrap_or(false)
    }

    /// Active agent types declaring `capability`, most collaboration history
    /// first; ties keep registration order.
    pub fn find_by_capability(&self, capability: &str) -> Vec<String> {
        let mut matches: Vec<(usize, u64, String)> = self
            .profiles
            .iter()
            .filter(|p| p.active && p.has_capability(capability))
            .map(|p| (p.history.len(), p.registration_seq, p.agent_type.clone()))
            .collect();
        matches.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        matches.into_iter().map(|(_, _, t)| t).collect()
    }

    pub fn active_count(&self) -> usize {
        self.profiles.iter().filter(|p| p.active).count()
    }

    pub fn total_count(&self) -> usize {
        self.profiles.len()
    }

    /// Open a session between two agent types and record it in both histories
    #[tracing::instrument(skip(self))]
    pub fn start_collaboration_session(
        &self,
        initiator_type: &str,
        target_type: &str,
        purpose: &str,
    ) -> String {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            CollaborationSession {
                id: id.clone(),
                initiator_type: initiator_type.to_string(),
                target_type: target_type.to_string(),
                purpose: purpose.to_string(),
                started_at: now,
                ended_at: None,
                status: SessionStatus::Active,
                messages: Vec::new(),
            },
        );

        for (owner, partner) in [(initiator_type, target_type), (target_type, initiator_type)] {
            match self.profiles.get_mut(owner) {
                Some(mut profile) => profile.history.push(CollaborationRecord {
                    partner_type: partner.to_string(),
                    purpose: purpose.to_string(),
                    timestamp: now,
                }),
                // external initiators such as the system bridge have no profile
                None => debug!(agent_type = %owner, "no profile to record collaboration on"),
            }
        }
        self.touch();
        debug!(session_id = %id, "collaboration session started");
        id
    }

    pub fn session(&self, session_id: &str) -> Option<CollaborationSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn sessions_for(&self, agent_type: &str) -> Vec<CollaborationSession> {
        let mut out: Vec<CollaborationSession> = self
            .sessions
            .iter()
            .filter(|s| s.involves(agent_type))
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| s.started_at);
        out
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    pub fn complete_session(&self, session_id: &str) -> Result<CollaborationSession> {
        self.transition(session_id, SessionStatus::Completed)
    }

    pub fn pause_session(&self, session_id: &str) -> Result<CollaborationSession> {
        self.transition(session_id, SessionStatus::Paused)
    }

    pub fn terminate_session(&self, session_id: &str) -> Result<CollaborationSession> {
        self.transition(session_id, SessionStatus::Terminated)
    }

    /// Append a message to an active session's history
    pub fn record_session_message(
        &self,
        session_id: &str,
        sender_type: &str,
        content: impl Into<String>,
    ) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| MeshError::UnknownSession(session_id.to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(MeshError::InvalidTransition(format!(
                "session {} is {:?}, messages require Active",
                session_id, session.status
            )));
        }
        session.messages.push(SessionMessage {
            sender_type: sender_type.to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        match self.last_update_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    // Every non-Active status is reachable only from Active.
    fn transition(&self, session_id: &str, to: SessionStatus) -> Result<CollaborationSession> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| MeshError::UnknownSession(session_id.to_string()))?;
        if session.status != SessionStatus::Active || to == SessionStatus::Active {
            return Err(MeshError::InvalidTransition(format!(
                "session {}: {:?} -> {:?}",
                session_id, session.status, to
            )));
        }
        session.status = to;
        if to.is_terminal() {
            session.ended_at = Some(Utc::now());
        }
        let snapshot = session.clone();
        drop(session);
        self.touch();
        Ok(snapshot)
    }

    fn touch(&self) {
        self.last_update_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}
