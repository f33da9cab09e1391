use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::context::AgentContext;
use crate::{Event, Result};

/// Agent-specific logic driven by the lifecycle wrapper [`super::Agent`].
///
/// Every hook has a default that ignores the event at `debug` level, so an
/// agent only implements the kinds it cares about and keeps working when peers
/// start publishing kinds it has never seen.
///
/// Hooks take `&self` and may run concurrently for one agent. Behaviors with
/// mutable state keep it behind their own lock and release it before awaiting
/// a collaboration.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Setup run before the agent registers with the mesh
    async fn on_init(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    /// Teardown run after the agent left the mesh
    async fn on_shutdown(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn on_agent_registered(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        ignored(ctx, event);
        Ok(())
    }

    async fn on_agent_unregistered(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        ignored(ctx, event);
        Ok(())
    }

    /// Return `Some(payload)` to answer the requester
    async fn on_collaboration_request(
        &self,
        ctx: &AgentContext,
        event: &Event,
    ) -> Result<Option<Value>> {
        ignored(ctx, event);
        Ok(None)
    }

    async fn on_collaboration_reply(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        ignored(ctx, event);
        Ok(())
    }

    async fn on_state_changed(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        ignored(ctx, event);
        Ok(())
    }

    async fn on_pattern_learned(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        ignored(ctx, event);
        Ok(())
    }

    async fn on_signal(&self, ctx: &AgentContext, event: &Event) -> Result<()> {
        ignored(ctx, event);
        Ok(())
    }

    async fn on_custom(&self, ctx: &AgentContext, _name: &str, event: &Event) -> Result<()> {
        ignored(ctx, event);
        Ok(())
    }
}

fn ignored(ctx: &AgentContext, event: &Event) {
    debug!(agent_id = %ctx.agent_id(), kind = %event.kind(), event_id = %event.id(), "event ignored");
}
