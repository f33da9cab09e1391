use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use conclave_bridge::{BridgeConfig, SystemBridge};
use conclave_core::telemetry::init_tracing;
use conclave_core::{Agent, AgentBehavior, AgentContext, AgentDescriptor, Event, Mesh, MeshConfig};

/// Logs every routed signal and acknowledges escalations
struct TriageLogger;

#[async_trait]
impl AgentBehavior for TriageLogger {
    async fn on_signal(&self, ctx: &AgentContext, event: &Event) -> conclave_core::Result<()> {
        info!(
            agent_id = %ctx.agent_id(),
            category = ?event.meta_str("category"),
            severity = ?event.meta("severity"),
            urgent = ?event.meta("requires_immediate_attention"),
            "signal triaged"
        );
        Ok(())
    }

    async fn on_collaboration_request(
        &self,
        ctx: &AgentContext,
        event: &Event,
    ) -> conclave_core::Result<Option<Value>> {
        warn!(agent_id = %ctx.agent_id(), topic = ?event.meta_str("topic"), "escalation received");
        Ok(Some(json!({"acknowledged": true, "by": ctx.agent_type()})))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    if let Err(e) = init_tracing() {
        eprintln!("tracing already initialised: {e}");
    }

    let mesh = Mesh::new(MeshConfig::from_env()).await?;
    mesh.start().await?;

    let bridge_config = BridgeConfig::from_env();
    let mut triage_caps: Vec<String> = bridge_config.routes.values().cloned().collect();
    triage_caps.push(bridge_config.fallback_capability.clone());
    let triage = Agent::new(
        AgentDescriptor::new("triage-1", "TRIAGE", triage_caps),
        TriageLogger,
        mesh.clone(),
    );
    let agents = vec![triage];
    let report = mesh.activate_all(&agents).await;
    if !report.all_activated() {
        warn!(failed = ?report.failed, "some agents failed to start");
    }

    let bridge = Arc::new(SystemBridge::new(mesh.clone(), bridge_config));
    info!(status = ?bridge.status(), "reading host signals from stdin (JSON lines)");

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut in_flight = Vec::new();
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match SystemBridge::parse_signal(&line) {
            Ok(signal) => in_flight.push(bridge.submit(signal)),
            Err(e) => warn!(error = %e, "skipping malformed signal line"),
        }
    }

    info!(pending = in_flight.len(), "stdin closed; draining");
    for handle in in_flight {
        let _ = handle.await;
    }
    bridge.deactivate();
    info!(status = ?bridge.status(), snapshot = ?mesh.snapshot(), "shutting down");

    mesh.shutdown_all(&agents).await;
    mesh.shutdown().await?;
    Ok(())
}
