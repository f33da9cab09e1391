// Mesh runtime configuration
use std::time::Duration;

/// Default time-to-live for shared entries written without an explicit ttl.
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default deadline for a scatter-gather collaboration request.
pub const DEFAULT_COLLABORATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Runtime configuration shared by the store, registry and event bus
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// TTL applied by `SharedStateStore::set_default`
    pub default_ttl: Duration,
    /// Deadline used when a collaboration request does not carry one
    pub collaboration_timeout: Duration,
    /// Upper bound on handler invocations running at the same time
    pub max_concurrent_deliveries: usize,
    /// Interval of the background TTL sweep; `None` keeps eviction lazy-only
    pub sweep_interval: Option<Duration>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_ENTRY_TTL,
            collaboration_timeout: DEFAULT_COLLABORATION_TIMEOUT,
            max_concurrent_deliveries: 64,
            sweep_interval: None,
        }
    }
}

impl MeshConfig {
    /// Build a config from `CONCLAVE_*` environment variables, falling back to
    /// defaults for anything missing or unparsable.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            default_ttl: env_u64("CONCLAVE_DEFAULT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(base.default_ttl),
            collaboration_timeout: env_u64("CONCLAVE_COLLAB_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.collaboration_timeout),
            max_concurrent_deliveries: env_u64("CONCLAVE_MAX_CONCURRENT_DELIVERIES")
                .map(|n| n.max(1) as usize)
                .unwrap_or(base.max_concurrent_deliveries),
            // 0 disables the sweeper
            sweep_interval: env_u64("CONCLAVE_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn with_collaboration_timeout(mut self, timeout: Duration) -> Self {
        self.collaboration_timeout = timeout;
        self
    }
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
