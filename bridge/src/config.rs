use std::collections::BTreeMap;
use std::time::Duration;

/// Route table used when `CONCLAVE_BRIDGE_CATEGORIES` is not set
pub const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("ERROR", "TROUBLESHOOTING"),
    ("PERFORMANCE", "PERFORMANCE_ANALYSIS"),
    ("SECURITY", "SECURITY_REVIEW"),
    ("RISK", "RISK_ASSESSMENT"),
    ("COMPLIANCE", "COMPLIANCE_CHECK"),
    ("MARKET", "MARKET_ANALYSIS"),
];

/// Capability asked during escalation when the category has no route
pub const DEFAULT_ESCALATION_CAPABILITY: &str = "INCIDENT_RESPONSE";

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Signals with a risk score strictly above this escalate
    pub risk_threshold: f64,
    /// Deadline of the escalation scatter-gather
    pub escalation_timeout: Duration,
    /// Category (uppercase) -> suggested capability
    pub routes: BTreeMap<String, String>,
    pub fallback_capability: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            risk_threshold: 70.0,
            escalation_timeout: Duration::from_secs(30),
            routes: DEFAULT_ROUTES
                .iter()
                .map(|(c, cap)| (c.to_string(), cap.to_string()))
                .collect(),
            fallback_capability: DEFAULT_ESCALATION_CAPABILITY.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Read `CONCLAVE_BRIDGE_*` variables, keeping defaults for anything
    /// missing or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(threshold) = env_var("CONCLAVE_BRIDGE_RISK_THRESHOLD").and_then(|v| v.parse().ok()) {
            cfg.risk_threshold = threshold;
        }
        if let Some(ms) = env_var("CONCLAVE_BRIDGE_ESCALATION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            cfg.escalation_timeout = Duration::from_millis(ms);
        }
        if let Some(list) = env_var("CONCLAVE_BRIDGE_CATEGORIES") {
            let routes = parse_routes(&list);
            if !routes.is_empty() {
                cfg.routes = routes;
            }
        }
        if let Some(cap) = env_var("CONCLAVE_BRIDGE_FALLBACK_CAPABILITY") {
            cfg.fallback_capability = cap;
        }
        cfg
    }
}

/// Parse `ERROR=TROUBLESHOOTING,RISK=RISK_ASSESSMENT`; malformed pairs are skipped
pub fn parse_routes(list: &str) -> BTreeMap<String, String> {
    list.split(',')
        .filter_map(|pair| {
            let (category, capability) = pair.split_once('=')?;
            let category = category.trim().to_ascii_uppercase();
            let capability = capability.trim();
            if category.is_empty() || capability.is_empty() {
                return None;
            }
            Some((category, capability.to_string()))
        })
        .collect()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
