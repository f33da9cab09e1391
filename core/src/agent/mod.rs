//! Agent lifecycle split into smaller files for readability.
//! - behavior.rs: AgentBehavior trait (per-kind hooks)
//! - context.rs: AgentContext handed to hooks
//! - instance.rs: Agent struct, lifecycle state machine and dispatch

mod behavior;
mod context;
mod instance;

pub use behavior::AgentBehavior;
pub use context::AgentContext;
pub use instance::{Agent, LifecycleState};
