//! Threshold validation
//!
//! Pure evaluation of one metric value against one rule. No side effects,
//! no I/O. Comparison direction comes from the rule; boundary comparisons
//! carry an epsilon tolerance so exact-threshold values do not flap.

use crate::contracts::{Comparison, Evaluation, Severity, ThresholdRule};
use crate::error::{GuardianError, Result};

/// Tolerance applied at bound comparisons unless the rule is
/// mathematically strict.
pub const EPSILON: f64 = 1e-6;

/// Evaluate a value against a rule.
///
/// `compliant` reflects the critical bound only; a warning-bound breach
/// yields `Severity::Moderate` with `compliant == true`. The deficit is
/// the distance from the most severe breached bound, 0.0 when nothing
/// breached.
pub fn evaluate(value: f64, rule: &ThresholdRule) -> Result<Evaluation> {
    validate_inputs(value, rule)?;

    if breaches(value, rule.critical_bound, rule) {
        return Ok(Evaluation {
            compliant: false,
            severity: Severity::Critical,
            deficit: (rule.critical_bound - value).abs(),
        });
    }

    if let Some(warning) = rule.warning_bound {
        if breaches(value, warning, rule) {
            return Ok(Evaluation {
                compliant: true,
                severity: Severity::Moderate,
                deficit: (warning - value).abs(),
            });
        }
    }

    Ok(Evaluation::compliant())
}

/// Whether `value` breaches `bound` under the rule's comparison direction
fn breaches(value: f64, bound: f64, rule: &ThresholdRule) -> bool {
    match rule.comparison {
        Comparison::GreaterOrEqual => {
            if rule.mathematically_strict {
                value < bound
            } else {
                value < bound - EPSILON
            }
        }
        Comparison::LessOrEqual => {
            if rule.mathematically_strict {
                value > bound
            } else {
                value > bound + EPSILON
            }
        }
    }
}

fn validate_inputs(value: f64, rule: &ThresholdRule) -> Result<()> {
    if !value.is_finite() {
        return Err(GuardianError::InvalidMetric {
            metric: rule.metric_name.clone(),
            reason: format!("non-finite value {}", value),
        });
    }
    if !rule.critical_bound.is_finite() {
        return Err(GuardianError::InvalidRule {
            metric: rule.metric_name.clone(),
            reason: format!("non-finite critical bound {}", rule.critical_bound),
        });
    }
    if let Some(warning) = rule.warning_bound {
        if !warning.is_finite() {
            return Err(GuardianError::InvalidRule {
                metric: rule.metric_name.clone(),
                reason: format!("non-finite warning bound {}", warning),
            });
        }
        // The warning bound must fire before the critical one.
        let ordered = match rule.comparison {
            Comparison::GreaterOrEqual => warning >= rule.critical_bound,
            Comparison::LessOrEqual => warning <= rule.critical_bound,
        };
        if !ordered {
            return Err(GuardianError::InvalidRule {
                metric: rule.metric_name.clone(),
                reason: format!(
                    "warning bound {} is on the wrong side of critical bound {} for {}",
                    warning, rule.critical_bound, rule.comparison
                ),
            });
        }
    }
    Ok(())
}
