use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity reported by the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// High and Critical always escalate
    pub fn is_urgent(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal raised by a host subsystem, as it arrives on the wire:
///
/// ```json
/// {"id":"sig-1","category":"ERROR","severity":"HIGH","message":"disk full","timestamp":"2026-01-05T10:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSignal {
    pub id: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl HostSignal {
    pub fn new(id: impl Into<String>, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            severity: None,
            risk_score: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_risk_score(mut self, score: f64) -> Self {
        self.risk_score = Some(score);
        self
    }

    /// Category in the canonical form used by the route table
    pub fn normalized_category(&self) -> String {
        self.category.trim().to_ascii_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_json() {
        let sig: HostSignal = serde_json::from_str(
            r#"{"id":"s1","category":"risk","riskScore":82.5,"message":"VaR breach","timestamp":"2026-01-05T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(sig.risk_score, Some(82.5));
        assert!(sig.severity.is_none());
        assert_eq!(sig.normalized_category(), "RISK");
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical.is_urgent());
        assert!(Severity::High.is_urgent());
        assert!(!Severity::Medium.is_urgent());
        assert_eq!(
            serde_json::to_value(Severity::Critical).unwrap(),
            serde_json::json!("CRITICAL")
        );
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let sig: HostSignal =
            serde_json::from_str(r#"{"id":"s2","category":"ERROR","severity":"LOW"}"#).unwrap();
        assert_eq!(sig.severity, Some(Severity::Low));
        assert!(sig.message.is_empty());
        assert!(sig.timestamp <= Utc::now());
    }
}
