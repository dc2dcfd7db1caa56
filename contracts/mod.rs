//! Compliance Guardian Agent Contracts
//!
//! Data model for threshold monitoring, violation classification,
//! time-bounded consultation, and circuit-breaker fallback.

mod events;

pub use events::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Comparison direction for a threshold rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Value must stay at or above the bound (minimum-floor metrics
    /// such as revenue-share ratios)
    GreaterOrEqual,
    /// Value must stay at or below the bound (ceiling metrics)
    LessOrEqual,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::GreaterOrEqual => write!(f, ">="),
            Comparison::LessOrEqual => write!(f, "<="),
        }
    }
}

/// Severity tier for evaluations and violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Compliant - no action required
    None,
    /// Warning bound breached - candidate for consultation
    Moderate,
    /// Critical bound breached - immediate rollback
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::None => write!(f, "none"),
            Severity::Moderate => write!(f, "moderate"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Configured boundary and comparison direction for one metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    /// Metric this rule applies to
    pub metric_name: String,

    /// Bound whose breach is a critical violation
    pub critical_bound: f64,

    /// Optional earlier bound whose breach is a moderate violation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_bound: Option<f64>,

    /// Comparison direction
    pub comparison: Comparison,

    /// When true, the bound is an exact inequality with no epsilon grace
    #[serde(default)]
    pub mathematically_strict: bool,
}

impl ThresholdRule {
    /// Rule enforcing a minimum floor (value must stay >= bound)
    pub fn floor(metric_name: impl Into<String>, critical_bound: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            critical_bound,
            warning_bound: None,
            comparison: Comparison::GreaterOrEqual,
            mathematically_strict: false,
        }
    }

    /// Rule enforcing a ceiling (value must stay <= bound)
    pub fn ceiling(metric_name: impl Into<String>, critical_bound: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            critical_bound,
            warning_bound: None,
            comparison: Comparison::LessOrEqual,
            mathematically_strict: false,
        }
    }

    /// Add a warning bound ahead of the critical one
    pub fn with_warning(mut self, warning_bound: f64) -> Self {
        self.warning_bound = Some(warning_bound);
        self
    }

    /// Require the bound as an exact inequality
    pub fn strict(mut self) -> Self {
        self.mathematically_strict = true;
        self
    }
}

/// Result of evaluating one value against one rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Evaluation {
    /// Whether the value satisfies the critical bound
    pub compliant: bool,

    /// Severity tier of the breach, `None` when compliant
    pub severity: Severity,

    /// Distance from the most severe breached bound, 0.0 when compliant
    pub deficit: f64,
}

impl Evaluation {
    /// Compliant evaluation with zero deficit
    pub fn compliant() -> Self {
        Self {
            compliant: true,
            severity: Severity::None,
            deficit: 0.0,
        }
    }
}

/// One metric observation from a named collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Collaborator that produced the value
    pub source_id: String,

    /// Metric name
    pub metric_name: String,

    /// Observed value
    pub value: f64,

    /// Collection timestamp
    pub collected_at: DateTime<Utc>,

    /// Whether the source was reachable when this was produced
    pub available: bool,
}

impl MetricSnapshot {
    /// Snapshot from a reachable source
    pub fn observed(source_id: impl Into<String>, metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            source_id: source_id.into(),
            metric_name: metric_name.into(),
            value,
            collected_at: Utc::now(),
            available: true,
        }
    }

    /// Conservative substitute for an unreachable source
    pub fn substituted(source_id: impl Into<String>, metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            source_id: source_id.into(),
            metric_name: metric_name.into(),
            value,
            collected_at: Utc::now(),
            available: false,
        }
    }
}

/// Health-check contract consumed from each collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall health score (0.0-1.0)
    pub health_score: f64,

    /// Source-reported status
    pub status: SourceStatus,

    /// Business metrics carried alongside the score
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl HealthReport {
    /// Healthy report with the given score
    pub fn healthy(health_score: f64) -> Self {
        Self {
            health_score,
            status: SourceStatus::Healthy,
            metrics: HashMap::new(),
        }
    }

    /// Attach a metric value
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Status a collaborator reports for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Fully operational
    Healthy,
    /// Operational with issues
    Degraded,
    /// Not operational
    Unhealthy,
}

/// Aggregated view over all collaborator health checks for one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Health score per source; unreachable sources carry their
    /// conservative default
    pub per_source_scores: HashMap<String, f64>,

    /// Merged business metrics (mean across sources reporting each metric)
    pub metrics: HashMap<String, f64>,

    /// Raw per-source observations, including conservative substitutions
    #[serde(default)]
    pub snapshots: Vec<MetricSnapshot>,

    /// Weighted mean of per-source scores, or the safe floor when no
    /// source was reachable
    pub overall_score: f64,

    /// Sources that answered their health check
    pub sources_available: u32,

    /// Sources queried
    pub sources_total: u32,

    /// True when no source was reachable and the safe floor was applied
    pub degraded_monitoring: bool,

    /// Collection timestamp
    pub collected_at: DateTime<Utc>,
}

impl AggregateResult {
    /// Fraction of sources that answered (0.0 when none were configured:
    /// an empty registry observes nothing)
    pub fn availability_ratio(&self) -> f64 {
        if self.sources_total == 0 {
            0.0
        } else {
            self.sources_available as f64 / self.sources_total as f64
        }
    }
}

/// Metric name under which the aggregator publishes its own availability
/// ratio, so "too many dependencies down" is detectable by an ordinary rule.
pub const AVAILABILITY_METRIC: &str = "sources.available_ratio";

/// A detected breach of a threshold rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Identifier assigned at first detection
    pub id: Uuid,

    /// Metric that breached; this is the dedup key while unresolved
    pub metric_name: String,

    /// Observed value at detection
    pub current_value: f64,

    /// The breached bound
    pub threshold: f64,

    /// Severity tier
    pub severity: Severity,

    /// Detection timestamp
    pub detected_at: DateTime<Utc>,
}

/// Lifecycle state of a violation inside the decision engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationState {
    /// Classified, not yet acted on
    Detected,
    /// Critical path: rollback invoked (stays here while retries run)
    ImmediateRollback,
    /// Moderate path: consultation session open
    AwaitingConsultation,
    /// Terminal
    Resolved(Resolution),
}

/// Terminal resolution of a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Rollback plan executed successfully
    Rollback,
    /// Consultation decided the outcome (approved or rejected)
    Consultation,
    /// Consultation timed out under the continue policy
    Expired,
}

/// Why a rollback plan was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Critical violation, no consultation
    Immediate,
    /// Moderate violation approved by its consultation session
    ConsultationApproved,
}

/// Record of a corrective action tied to one or more violations.
/// Created at most once per unresolved violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPlan {
    /// Plan identifier
    pub id: Uuid,

    /// Violations this plan covers
    pub violation_ids: Vec<Uuid>,

    /// What triggered the plan
    pub trigger_type: TriggerType,

    /// Set once the rollback hook reports success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,

    /// Fallbacks the execution hook reported activating
    #[serde(default)]
    pub fallbacks_activated: Vec<String>,
}

impl RollbackPlan {
    /// New unexecuted plan for a single violation
    pub fn for_violation(violation_id: Uuid, trigger_type: TriggerType) -> Self {
        Self {
            id: Uuid::new_v4(),
            violation_ids: vec![violation_id],
            trigger_type,
            executed_at: None,
            fallbacks_activated: Vec::new(),
        }
    }
}

/// Result the rollback-execution hook returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// Whether the deployment/traffic infrastructure accepted the plan
    pub success: bool,

    /// Fallbacks activated while rolling back
    #[serde(default)]
    pub fallbacks_activated: Vec<String>,
}

/// Status of a consultation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Open, accepting votes
    Pending,
    /// Quorum met and approval threshold reached
    Approved,
    /// Quorum met, approval threshold not reached
    Rejected,
    /// Deadline passed without quorum
    TimedOut,
    /// Cancelled because the violation escalated to the immediate path
    Superseded,
}

/// Decision a resolved session yields to the decision engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    TimedOut,
    /// The session was cancelled; the violation is being handled on the
    /// immediate path and the decision task must take no action.
    Superseded,
}

/// Read-only view of a consultation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationSession {
    /// Session identifier
    pub id: Uuid,

    /// Violation under consultation
    pub violation_id: Uuid,

    /// Metric the violation is keyed on
    pub metric_name: String,

    /// Absolute deadline
    pub deadline: DateTime<Utc>,

    /// Representatives entitled to vote
    pub representatives: Vec<String>,

    /// Current status
    pub status: SessionStatus,

    /// Approvals received so far
    pub votes_for: u32,

    /// Rejections received so far
    pub votes_against: u32,
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls short-circuit to fallback
    Open,
    /// Exactly one probe call allowed through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Call accounting for one breaker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BreakerCallStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub open_transitions: u64,
    pub fallback_invocations: u64,
}

/// Read-only snapshot of one breaker for the monitoring endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Dependency name
    pub name: String,

    /// Current state
    pub state: CircuitState,

    /// Failures since the last success in CLOSED
    pub consecutive_failures: u32,

    /// When the breaker last opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,

    /// Earliest time a probe will be admitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_probe_at: Option<DateTime<Utc>>,

    /// Call accounting
    pub stats: BreakerCallStats,
}

/// Degraded-mode response produced instead of contacting a dependency.
/// Always flagged degraded; never indistinguishable from a real response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackResponse {
    /// Dependency this stands in for
    pub dependency: String,

    /// Always true
    pub degraded: bool,

    /// Invariants the dependency would normally guarantee, restated
    /// explicitly (e.g. the enforced minimum-share floor)
    pub guarantees: Vec<String>,

    /// Response payload
    pub payload: serde_json::Value,

    /// Generation timestamp
    pub generated_at: DateTime<Utc>,
}

/// State-changing intent captured while a dependency is open, replayed
/// once it recovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedIntent {
    pub id: Uuid,
    pub dependency: String,
    pub intent: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

/// Policy when a consultation session times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Fail-safe: roll back the unresolved moderate violation
    Rollback,
    /// Optimistic: resolve as expired and keep monitoring
    Continue,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// Consecutive failures that open a breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long a breaker stays open before admitting a probe
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Monitoring sweep interval
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,

    /// Minimum participation fraction before the approval threshold
    /// is evaluated
    #[serde(default = "default_quorum_fraction")]
    pub quorum_fraction: f64,

    /// Approval fraction among votes cast
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,

    /// Consultation session lifetime
    #[serde(default = "default_consultation_timeout_ms")]
    pub consultation_timeout_ms: u64,

    /// What to do when a session times out
    #[serde(default = "default_timeout_policy")]
    pub default_on_timeout: TimeoutPolicy,

    /// Overall score reported when zero sources are available.
    /// Must be strictly between 0 and 1.
    #[serde(default = "default_safe_floor")]
    pub safe_floor_score: f64,

    /// Per-source health check timeout
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// Rollback hook retries before escalating a fatal alert
    #[serde(default = "default_rollback_max_retries")]
    pub rollback_max_retries: u32,

    /// Base delay for rollback retry backoff (doubles per attempt)
    #[serde(default = "default_rollback_retry_base_ms")]
    pub rollback_retry_base_ms: u64,

    /// Representatives invited to consultation sessions
    #[serde(default)]
    pub representatives: Vec<String>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_monitoring_interval_ms() -> u64 {
    5_000
}

fn default_quorum_fraction() -> f64 {
    0.10
}

fn default_approval_threshold() -> f64 {
    0.60
}

fn default_consultation_timeout_ms() -> u64 {
    300_000
}

fn default_timeout_policy() -> TimeoutPolicy {
    TimeoutPolicy::Rollback
}

fn default_safe_floor() -> f64 {
    0.5
}

fn default_health_check_timeout_ms() -> u64 {
    500
}

fn default_rollback_max_retries() -> u32 {
    3
}

fn default_rollback_retry_base_ms() -> u64 {
    100
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            monitoring_interval_ms: default_monitoring_interval_ms(),
            quorum_fraction: default_quorum_fraction(),
            approval_threshold: default_approval_threshold(),
            consultation_timeout_ms: default_consultation_timeout_ms(),
            default_on_timeout: default_timeout_policy(),
            safe_floor_score: default_safe_floor(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            rollback_max_retries: default_rollback_max_retries(),
            rollback_retry_base_ms: default_rollback_retry_base_ms(),
            representatives: Vec::new(),
        }
    }
}

impl GuardianConfig {
    /// Reject configurations whose fractions fall outside their domains
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.quorum_fraction) {
            return Err(format!(
                "quorum_fraction must be within [0, 1], got {}",
                self.quorum_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.approval_threshold) {
            return Err(format!(
                "approval_threshold must be within [0, 1], got {}",
                self.approval_threshold
            ));
        }
        if self.safe_floor_score <= 0.0 || self.safe_floor_score >= 1.0 {
            return Err(format!(
                "safe_floor_score must be strictly between 0 and 1, got {}",
                self.safe_floor_score
            ));
        }
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}

/// One violation as the decision engine currently sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationStatus {
    pub violation: Violation,
    pub state: ViolationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<RollbackPlan>,
}

/// Summary of one monitoring sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub sweep_id: Uuid,
    pub overall_score: f64,
    pub sources_available: u32,
    pub sources_total: u32,
    pub degraded_monitoring: bool,
    pub violations_detected: u32,
    pub critical_count: u32,
    pub moderate_count: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Read-only snapshot for external dashboards. Always served, even
/// during degraded monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub violations: Vec<ViolationStatus>,
    pub sessions: Vec<ConsultationSession>,
    pub breakers: Vec<BreakerSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sweep: Option<SweepReport>,
    pub degraded_monitoring: bool,
    pub generated_at: DateTime<Utc>,
}
