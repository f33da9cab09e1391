// Logging and metrics setup
use opentelemetry::metrics::{Counter, UpDownCounter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once: later calls leave the first subscriber in place
/// and return an error instead of panicking.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()?;

    Ok(())
}

/// Agent lifecycle counters published on the global OpenTelemetry meter.
///
/// Without an installed meter provider these are no-ops.
#[derive(Clone)]
pub struct MeshMetrics {
    pub agents_active: UpDownCounter<i64>,
    pub agents_registered: Counter<u64>,
    pub agents_unregistered: Counter<u64>,
    pub collaborations: Counter<u64>,
}

impl MeshMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("conclave.mesh");

        let agents_active = meter
            .i64_up_down_counter("mesh.agents.active")
            .with_description("Number of active agents")
            .init();

        let agents_registered = meter
            .u64_counter("mesh.agents.registered")
            .with_description("Total number of agent registrations")
            .init();

        let agents_unregistered = meter
            .u64_counter("mesh.agents.unregistered")
            .with_description("Total number of agent unregistrations")
            .init();

        let collaborations = meter
            .u64_counter("mesh.collaborations.requested")
            .with_description("Total number of scatter-gather requests")
            .init();

        Self {
            agents_active,
            agents_registered,
            agents_unregistered,
            collaborations,
        }
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}
