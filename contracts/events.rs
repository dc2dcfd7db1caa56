//! Outbound notification events
//!
//! Typed payloads for the community/ops notification channel. Every event
//! carries a dedup hash so downstream alerting can coalesce repeats of the
//! same underlying condition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{Decision, RollbackPlan, Severity, Violation};

/// Urgency tier attached to an outbound notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    /// Routine lifecycle event
    Info,
    /// Needs attention, not immediately dangerous
    Warning,
    /// Escalation: something the monitor could not recover on its own
    Fatal,
}

/// Events emitted through the notification hook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GuardianEvent {
    /// A threshold rule fired
    ViolationDetected { violation: Violation },

    /// A rollback plan executed successfully
    RollbackExecuted {
        plan: RollbackPlan,
        metric_name: String,
    },

    /// The rollback hook exhausted its retries
    RollbackFailed {
        plan_id: Uuid,
        metric_name: String,
        attempts: u32,
        last_error: String,
    },

    /// A consultation session was opened for a moderate violation
    ConsultationOpened {
        session_id: Uuid,
        violation_id: Uuid,
        metric_name: String,
        deadline: DateTime<Utc>,
    },

    /// A consultation session resolved
    ConsultationResolved {
        session_id: Uuid,
        metric_name: String,
        decision: Decision,
    },

    /// A circuit breaker opened for a dependency
    BreakerOpened {
        dependency: String,
        consecutive_failures: u32,
    },

    /// A circuit breaker recovered (HALF_OPEN probe succeeded)
    BreakerRecovered {
        dependency: String,
        queued_intents: u32,
    },

    /// Zero sources answered a sweep; the safe floor is in effect
    DegradedMonitoring { sources_total: u32 },
}

impl GuardianEvent {
    /// Stable event kind string
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ViolationDetected { .. } => "violation_detected",
            Self::RollbackExecuted { .. } => "rollback_executed",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::ConsultationOpened { .. } => "consultation_opened",
            Self::ConsultationResolved { .. } => "consultation_resolved",
            Self::BreakerOpened { .. } => "breaker_opened",
            Self::BreakerRecovered { .. } => "breaker_recovered",
            Self::DegradedMonitoring { .. } => "degraded_monitoring",
        }
    }

    /// Urgency tier for routing
    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::ViolationDetected { violation } => match violation.severity {
                Severity::Critical => EventSeverity::Fatal,
                _ => EventSeverity::Warning,
            },
            Self::RollbackFailed { .. } => EventSeverity::Fatal,
            Self::BreakerOpened { .. } | Self::DegradedMonitoring { .. } => EventSeverity::Warning,
            Self::RollbackExecuted { .. }
            | Self::ConsultationOpened { .. }
            | Self::ConsultationResolved { .. }
            | Self::BreakerRecovered { .. } => EventSeverity::Info,
        }
    }

    /// Key identifying the underlying condition, independent of timestamps
    fn dedup_key(&self) -> String {
        match self {
            Self::ViolationDetected { violation } => {
                format!("{}:{}", violation.metric_name, violation.severity)
            }
            Self::RollbackExecuted { metric_name, plan } => {
                format!("{}:{:?}", metric_name, plan.trigger_type)
            }
            Self::RollbackFailed { metric_name, .. } => metric_name.clone(),
            Self::ConsultationOpened { metric_name, .. } => metric_name.clone(),
            Self::ConsultationResolved {
                metric_name,
                decision,
                ..
            } => format!("{}:{:?}", metric_name, decision),
            Self::BreakerOpened { dependency, .. } => dependency.clone(),
            Self::BreakerRecovered { dependency, .. } => dependency.clone(),
            Self::DegradedMonitoring { .. } => "degraded".to_string(),
        }
    }

    /// Human-readable one-liner
    pub fn summary(&self) -> String {
        match self {
            Self::ViolationDetected { violation } => format!(
                "{} violation on {}: value {:.4} against threshold {:.4}",
                violation.severity, violation.metric_name, violation.current_value, violation.threshold
            ),
            Self::RollbackExecuted { plan, metric_name } => format!(
                "rollback {} executed for {} ({} fallbacks activated)",
                plan.id,
                metric_name,
                plan.fallbacks_activated.len()
            ),
            Self::RollbackFailed {
                metric_name,
                attempts,
                last_error,
                ..
            } => format!(
                "rollback for {} failed after {} attempts: {}",
                metric_name, attempts, last_error
            ),
            Self::ConsultationOpened {
                metric_name,
                deadline,
                ..
            } => format!("consultation opened for {} (deadline {})", metric_name, deadline),
            Self::ConsultationResolved {
                metric_name,
                decision,
                ..
            } => format!("consultation for {} resolved: {:?}", metric_name, decision),
            Self::BreakerOpened {
                dependency,
                consecutive_failures,
            } => format!(
                "breaker for {} opened after {} consecutive failures",
                dependency, consecutive_failures
            ),
            Self::BreakerRecovered {
                dependency,
                queued_intents,
            } => format!(
                "breaker for {} recovered, {} queued intents to replay",
                dependency, queued_intents
            ),
            Self::DegradedMonitoring { sources_total } => format!(
                "degraded monitoring: 0 of {} sources reachable, safe floor in effect",
                sources_total
            ),
        }
    }
}

/// Envelope delivered to notification collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Unique per emission
    pub event_id: Uuid,

    /// Agent identifier
    pub agent_id: String,

    /// Agent version
    pub agent_version: String,

    /// Payload
    pub event: GuardianEvent,

    /// Urgency tier
    pub severity: EventSeverity,

    /// Hash of the underlying condition for downstream coalescing
    pub dedup_hash: String,

    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub const AGENT_ID: &'static str = "compliance-guardian-agent";
    pub const AGENT_VERSION: &'static str = "0.1.0";

    /// Wrap an event for delivery
    pub fn from_event(event: GuardianEvent) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(event.kind().as_bytes());
        hasher.update(event.dedup_key().as_bytes());
        let dedup_hash = hex::encode(hasher.finalize());

        Self {
            event_id: Uuid::new_v4(),
            agent_id: Self::AGENT_ID.to_string(),
            agent_version: Self::AGENT_VERSION.to_string(),
            severity: event.severity(),
            dedup_hash,
            event,
            timestamp: Utc::now(),
        }
    }
}
