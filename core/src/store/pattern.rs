use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::SharedStateStore;

/// Confidence assigned to a freshly recorded pattern
pub const DEFAULT_PATTERN_CONFIDENCE: f64 = 0.8;

/// Confidence delta applied per feedback signal
pub const FEEDBACK_STEP: f64 = 0.1;

/// A reusable observation published by one agent for others to consult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningPattern {
    pub key: String,
    pub payload: Value,
    pub source_type: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub usage_count: u64,
}

impl LearningPattern {
    pub fn new(key: impl Into<String>, payload: Value, source_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload,
            source_type: source_type.into(),
            confidence: DEFAULT_PATTERN_CONFIDENCE,
            created_at: Utc::now(),
            usage_count: 0,
        }
    }
}

impl SharedStateStore {
    /// Record (or replace) a learning pattern; confidence and usage start fresh
    pub fn record_pattern(
        &self,
        key: impl Into<String>,
        payload: Value,
        source_type: impl Into<String>,
    ) -> LearningPattern {
        let pattern = LearningPattern::new(key, payload, source_type);
        debug!(key = %pattern.key, source = %pattern.source_type, "learning pattern recorded");
        self.patterns.insert(pattern.key.clone(), pattern.clone());
        self.touch();
        pattern
    }

    /// Copy of the pattern; counts as one use
    pub fn pattern(&self, key: &str) -> Option<LearningPattern> {
        self.patterns.get_mut(key).map(|mut p| {
            p.usage_count += 1;
            p.clone()
        })
    }

    /// Copy of the pattern without counting a use
    pub fn peek_pattern(&self, key: &str) -> Option<LearningPattern> {
        self.patterns.get(key).map(|p| p.clone())
    }

    /// Nudge confidence up or down by [`FEEDBACK_STEP`], clamped to `[0, 1]`.
    /// Returns the new confidence, or `None` for an unknown key.
    pub fn apply_feedback(&self, key: &str, positive: bool) -> Option<f64> {
        let mut pattern = self.patterns.get_mut(key)?;
        let delta = if positive { FEEDBACK_STEP } else { -FEEDBACK_STEP };
        pattern.confidence = (pattern.confidence + delta).clamp(0.0, 1.0);
        let confidence = pattern.confidence;
        drop(pattern);
        self.touch();
        Some(confidence)
    }

    /// Patterns contributed by `source_type`, most confident first
    pub fn patterns_from(&self, source_type: &str) -> Vec<LearningPattern> {
        let mut out: Vec<LearningPattern> = self
            .patterns
            .iter()
            .filter(|p| p.source_type == source_type)
            .map(|p| p.clone())
            .collect();
        out.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feedback_is_clamped() {
        let store = SharedStateStore::default();
        store.record_pattern("npe", json!({"fix": "null check"}), "TROUBLESHOOTER");

        let raised = store.apply_feedback("npe", true).unwrap();
        assert!((raised - 0.9).abs() < 1e-9);
        let after = store.apply_feedback("npe", true).unwrap();
        assert!((after - 1.0).abs() < 1e-9);
        let capped = store.apply_feedback("npe", true).unwrap();
        assert!((capped - 1.0).abs() < 1e-9);

        for _ in 0..20 {
            store.apply_feedback("npe", false);
        }
        assert_eq!(store.peek_pattern("npe").unwrap().confidence, 0.0);
        assert_eq!(store.apply_feedback("missing", true), None);
    }

    #[test]
    fn reads_count_usage() {
        let store = SharedStateStore::default();
        store.record_pattern("p", json!(1), "A");
        store.pattern("p");
        let p = store.pattern("p").unwrap();
        assert_eq!(p.usage_count, 2);
        assert_eq!(store.peek_pattern("p").unwrap().usage_count, 2);
    }
}
