//! Violation classification
//!
//! Applies the threshold validator per rule against the aggregate's metric
//! map. When several rules fire for the same metric, the most severe wins.
//! Malformed rules are rejected locally and never surface as violations.

use crate::contracts::{AggregateResult, Severity, ThresholdRule, Violation};
use crate::engine::threshold;
use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

/// Maps aggregate results to severity-tiered violations
pub struct ViolationClassifier {
    rules: Vec<ThresholdRule>,
}

impl ViolationClassifier {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Classify one aggregate result.
    ///
    /// Metrics absent from the aggregate are skipped; service availability
    /// itself arrives as an ordinary metric (`sources.available_ratio`) and
    /// is subject to whatever rule is configured for it.
    pub fn classify(&self, aggregate: &AggregateResult) -> Vec<Violation> {
        let mut by_metric: HashMap<String, Violation> = HashMap::new();

        for rule in &self.rules {
            let Some(&value) = aggregate.metrics.get(&rule.metric_name) else {
                tracing::debug!(metric = %rule.metric_name, "metric absent from aggregate, rule skipped");
                continue;
            };

            let evaluation = match threshold::evaluate(value, rule) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(metric = %rule.metric_name, error = %e, "rule rejected");
                    continue;
                }
            };

            if evaluation.severity == Severity::None {
                continue;
            }

            let breached_bound = match evaluation.severity {
                Severity::Critical => rule.critical_bound,
                // Moderate can only come from a present warning bound.
                _ => rule.warning_bound.unwrap_or(rule.critical_bound),
            };

            let candidate = Violation {
                id: Uuid::new_v4(),
                metric_name: rule.metric_name.clone(),
                current_value: value,
                threshold: breached_bound,
                severity: evaluation.severity,
                detected_at: Utc::now(),
            };

            match by_metric.get(&rule.metric_name) {
                Some(existing) if existing.severity >= candidate.severity => {}
                _ => {
                    by_metric.insert(rule.metric_name.clone(), candidate);
                }
            }
        }

        let mut violations: Vec<Violation> = by_metric.into_values().collect();
        violations.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.metric_name.cmp(&b.metric_name)));
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::AVAILABILITY_METRIC;
    use std::collections::HashMap;

    fn aggregate(metrics: &[(&str, f64)]) -> AggregateResult {
        AggregateResult {
            per_source_scores: HashMap::new(),
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            snapshots: Vec::new(),
            overall_score: 1.0,
            sources_available: 3,
            sources_total: 3,
            degraded_monitoring: false,
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn test_compliant_metric_yields_nothing() {
        let classifier =
            ViolationClassifier::new(vec![ThresholdRule::floor("revenue.min_share_ratio", 0.75)]);
        let violations = classifier.classify(&aggregate(&[("revenue.min_share_ratio", 0.75)]));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_breach_yields_critical_violation() {
        let classifier =
            ViolationClassifier::new(vec![ThresholdRule::floor("revenue.min_share_ratio", 0.75)]);
        let violations = classifier.classify(&aggregate(&[("revenue.min_share_ratio", 0.60)]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Critical);
        assert_eq!(violations[0].threshold, 0.75);
        assert_eq!(violations[0].current_value, 0.60);
    }

    #[test]
    fn test_most_severe_wins_per_metric() {
        let classifier = ViolationClassifier::new(vec![
            ThresholdRule::floor("m", 0.50).with_warning(0.80),
            ThresholdRule::floor("m", 0.70),
        ]);
        // 0.60: moderate under the first rule, critical under the second.
        let violations = classifier.classify(&aggregate(&[("m", 0.60)]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Critical);
        assert_eq!(violations[0].threshold, 0.70);
    }

    #[test]
    fn test_availability_rule_fires_independently() {
        let classifier = ViolationClassifier::new(vec![
            ThresholdRule::floor("revenue.min_share_ratio", 0.75),
            ThresholdRule::floor(AVAILABILITY_METRIC, 0.5),
        ]);
        let violations = classifier.classify(&aggregate(&[
            ("revenue.min_share_ratio", 0.90),
            (AVAILABILITY_METRIC, 0.25),
        ]));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].metric_name, AVAILABILITY_METRIC);
    }

    #[test]
    fn test_absent_metric_is_skipped() {
        let classifier = ViolationClassifier::new(vec![ThresholdRule::floor("missing", 0.5)]);
        let violations = classifier.classify(&aggregate(&[("present", 0.1)]));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_malformed_rule_never_surfaces_as_violation() {
        let mut bad = ThresholdRule::floor("m", 0.5);
        bad.critical_bound = f64::NAN;
        let classifier = ViolationClassifier::new(vec![bad]);
        let violations = classifier.classify(&aggregate(&[("m", 0.1)]));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_violations_sorted_critical_first() {
        let classifier = ViolationClassifier::new(vec![
            ThresholdRule::floor("a", 0.1).with_warning(0.9),
            ThresholdRule::floor("b", 0.7),
        ]);
        let violations = classifier.classify(&aggregate(&[("a", 0.5), ("b", 0.5)]));
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].metric_name, "b");
        assert_eq!(violations[0].severity, Severity::Critical);
        assert_eq!(violations[1].severity, Severity::Moderate);
    }
}
