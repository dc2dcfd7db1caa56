//! Rollback decision engine
//!
//! Top-level controller for classified violations. Critical violations
//! roll back immediately; moderate ones go through a consultation
//! session. The violation table is the single source of truth for
//! deduplication: at most one rollback plan exists per unresolved
//! violation, and re-detection of an unresolved violation is a no-op.

use crate::contracts::{
    Decision, GuardianConfig, GuardianEvent, Resolution, RollbackOutcome, RollbackPlan, Severity,
    TimeoutPolicy, TriggerType, Violation, ViolationState, ViolationStatus,
};
use crate::engine::consultation::ConsultationCoordinator;
use crate::error::Result;
use crate::notify::Notifier;
use crate::telemetry::GuardianMetrics;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Rollback-execution hook, delegated to deployment/traffic-routing
/// infrastructure
pub trait RollbackExecutor: Send + Sync {
    fn execute_rollback(
        &self,
        plan: RollbackPlan,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RollbackOutcome>> + Send>>;
}

/// Ceiling on the exponential backoff between rollback attempts
const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Backoff before retry `attempt` (1-based): base * 2^(attempt-1),
/// capped so large attempt counts neither overflow nor stall for hours
fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
}

struct ViolationEntry {
    violation: Violation,
    state: ViolationState,
    plan: Option<RollbackPlan>,
}

/// Consumes classified violations and drives them to resolution
pub struct RollbackDecisionEngine {
    /// Keyed by metric name: the dedup key while a violation is unresolved
    table: RwLock<HashMap<String, ViolationEntry>>,
    executor: Arc<dyn RollbackExecutor>,
    notifier: Arc<dyn Notifier>,
    coordinator: Arc<ConsultationCoordinator>,
    metrics: Arc<GuardianMetrics>,
    config: GuardianConfig,
}

impl RollbackDecisionEngine {
    pub fn new(
        executor: Arc<dyn RollbackExecutor>,
        notifier: Arc<dyn Notifier>,
        coordinator: Arc<ConsultationCoordinator>,
        metrics: Arc<GuardianMetrics>,
        config: GuardianConfig,
    ) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            executor,
            notifier,
            coordinator,
            metrics,
            config,
        }
    }

    /// Process one cycle's violations.
    ///
    /// Re-detections of unresolved violations are no-ops, with one
    /// exception: a detection at a higher severity than the one in
    /// flight supersedes its consultation and takes the immediate path.
    /// Moderate violations do not block: their consultation outcomes
    /// are awaited on spawned tasks.
    pub async fn handle(self: &Arc<Self>, violations: Vec<Violation>) {
        enum Admission {
            New,
            Escalated(uuid::Uuid),
            Ignored,
        }

        for violation in violations {
            let admission = {
                let mut table = self.table.write().await;
                match table.get_mut(&violation.metric_name) {
                    Some(entry) if !matches!(entry.state, ViolationState::Resolved(_)) => {
                        // Escalation only while no plan exists yet; once a
                        // plan is created the exactly-once invariant wins.
                        if violation.severity > entry.violation.severity
                            && entry.plan.is_none()
                        {
                            let superseded = entry.violation.id;
                            entry.violation = violation.clone();
                            entry.state = ViolationState::Detected;
                            Admission::Escalated(superseded)
                        } else {
                            Admission::Ignored
                        }
                    }
                    _ => {
                        table.insert(
                            violation.metric_name.clone(),
                            ViolationEntry {
                                violation: violation.clone(),
                                state: ViolationState::Detected,
                                plan: None,
                            },
                        );
                        Admission::New
                    }
                }
            };

            match admission {
                Admission::Ignored => {
                    tracing::debug!(metric = %violation.metric_name, "violation already in flight, re-detection ignored");
                    continue;
                }
                Admission::Escalated(superseded) => {
                    self.coordinator.supersede(superseded).await;
                    tracing::warn!(metric = %violation.metric_name, "violation escalated, consultation superseded");
                }
                Admission::New => {}
            }

            self.metrics.record_violation(&violation.severity.to_string());
            self.notifier
                .notify(GuardianEvent::ViolationDetected {
                    violation: violation.clone(),
                })
                .await;

            match violation.severity {
                Severity::Critical => self.start_immediate(violation).await,
                Severity::Moderate => self.start_consultation(violation).await,
                Severity::None => {}
            }
        }

        self.metrics
            .set_active_violations(self.active_count().await);
    }

    /// Critical path: plan once, execute, resolve
    async fn start_immediate(self: &Arc<Self>, violation: Violation) {
        let metric = violation.metric_name.clone();
        let Some(plan) = self.create_plan(&metric, violation.id, TriggerType::Immediate).await
        else {
            return;
        };
        self.execute_plan(metric, plan, Resolution::Rollback, "immediate")
            .await;
    }

    /// Moderate path: open (or reuse) a consultation session and await
    /// its decision off the monitoring loop
    async fn start_consultation(self: &Arc<Self>, violation: Violation) {
        let ticket = self
            .coordinator
            .open(
                &violation,
                self.config.representatives.clone(),
                Duration::from_millis(self.config.consultation_timeout_ms),
            )
            .await;
        let session_id = ticket.session_id;

        {
            let mut table = self.table.write().await;
            if let Some(entry) = table.get_mut(&violation.metric_name) {
                entry.state = ViolationState::AwaitingConsultation;
            }
        }

        if ticket.reused {
            return;
        }

        self.notifier
            .notify(GuardianEvent::ConsultationOpened {
                session_id,
                violation_id: violation.id,
                metric_name: violation.metric_name.clone(),
                deadline: Utc::now()
                    + chrono::Duration::milliseconds(self.config.consultation_timeout_ms as i64),
            })
            .await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let decision = ticket.decision().await;
            engine.on_decision(violation, session_id, decision).await;
        });
    }

    /// Apply a consultation outcome to its violation
    async fn on_decision(
        self: &Arc<Self>,
        violation: Violation,
        session_id: uuid::Uuid,
        decision: Decision,
    ) {
        let metric = violation.metric_name.clone();
        let outcome_label = match decision {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
            Decision::TimedOut => "timed_out",
            // The immediate path owns a superseded violation.
            Decision::Superseded => return,
        };
        self.metrics.record_consultation(outcome_label);
        self.notifier
            .notify(GuardianEvent::ConsultationResolved {
                session_id,
                metric_name: metric.clone(),
                decision,
            })
            .await;

        match decision {
            Decision::Approved => {
                if let Some(plan) = self
                    .create_plan(&metric, violation.id, TriggerType::ConsultationApproved)
                    .await
                {
                    self.execute_plan(metric, plan, Resolution::Consultation, "consultation")
                        .await;
                }
            }
            Decision::Rejected => {
                let mut table = self.table.write().await;
                if let Some(entry) = table.get_mut(&metric) {
                    entry.state = ViolationState::Resolved(Resolution::Consultation);
                }
            }
            Decision::TimedOut => match self.config.default_on_timeout {
                TimeoutPolicy::Rollback => {
                    if let Some(plan) = self
                        .create_plan(&metric, violation.id, TriggerType::Immediate)
                        .await
                    {
                        self.execute_plan(metric, plan, Resolution::Rollback, "timeout_default")
                            .await;
                    }
                }
                TimeoutPolicy::Continue => {
                    // Expired violations leave the table so the next
                    // detection starts a fresh cycle.
                    let mut table = self.table.write().await;
                    table.remove(&metric);
                    tracing::info!(metric = %metric, "consultation timed out, continuing monitoring");
                }
            },
            Decision::Superseded => {}
        }

        self.metrics
            .set_active_violations(self.active_count().await);
    }

    /// Create the plan for an unresolved violation, exactly once.
    /// Returns `None` when a plan already exists or the violation is gone.
    async fn create_plan(
        &self,
        metric: &str,
        violation_id: uuid::Uuid,
        trigger_type: TriggerType,
    ) -> Option<RollbackPlan> {
        let mut table = self.table.write().await;
        let entry = table.get_mut(metric)?;
        if entry.plan.is_some() || matches!(entry.state, ViolationState::Resolved(_)) {
            return None;
        }
        entry.state = ViolationState::ImmediateRollback;
        let plan = RollbackPlan::for_violation(violation_id, trigger_type);
        entry.plan = Some(plan.clone());
        Some(plan)
    }

    /// Run the rollback hook with exponential backoff. On success the
    /// violation resolves; on exhaustion it stays in IMMEDIATE_ROLLBACK
    /// and a fatal alert goes out. Never resolved on failure.
    async fn execute_plan(
        &self,
        metric: String,
        plan: RollbackPlan,
        resolution: Resolution,
        trigger_label: &str,
    ) {
        let max_attempts = self.config.rollback_max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(self.config.rollback_retry_base_ms, attempt)).await;
            }

            match self.executor.execute_rollback(plan.clone()).await {
                Ok(outcome) if outcome.success => {
                    let executed = {
                        let mut table = self.table.write().await;
                        let entry = match table.get_mut(&metric) {
                            Some(e) => e,
                            None => return,
                        };
                        if let Some(stored) = entry.plan.as_mut() {
                            stored.executed_at = Some(Utc::now());
                            stored.fallbacks_activated = outcome.fallbacks_activated.clone();
                        }
                        entry.state = ViolationState::Resolved(resolution);
                        entry.plan.clone()
                    };

                    self.metrics.record_rollback(trigger_label, true);
                    if let Some(executed) = executed {
                        self.notifier
                            .notify(GuardianEvent::RollbackExecuted {
                                plan: executed,
                                metric_name: metric.clone(),
                            })
                            .await;
                    }
                    return;
                }
                Ok(_) => {
                    last_error = "rollback hook reported failure".to_string();
                    tracing::warn!(metric = %metric, attempt, "rollback hook reported failure");
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(metric = %metric, attempt, error = %e, "rollback hook errored");
                }
            }
        }

        // Exhausted: escalate, keep the violation unresolved.
        self.metrics.record_rollback(trigger_label, false);
        self.notifier
            .notify(GuardianEvent::RollbackFailed {
                plan_id: plan.id,
                metric_name: metric.clone(),
                attempts: max_attempts,
                last_error,
            })
            .await;
        tracing::error!(metric = %metric, attempts = max_attempts, "rollback execution exhausted retries, escalated");
    }

    /// Unresolved violation count
    pub async fn active_count(&self) -> usize {
        let table = self.table.read().await;
        table
            .values()
            .filter(|e| !matches!(e.state, ViolationState::Resolved(_)))
            .count()
    }

    /// Snapshot for the monitoring endpoint
    pub async fn status(&self) -> Vec<ViolationStatus> {
        let table = self.table.read().await;
        let mut statuses: Vec<ViolationStatus> = table
            .values()
            .map(|entry| ViolationStatus {
                violation: entry.violation.clone(),
                state: entry.state,
                plan: entry.plan.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.violation.metric_name.cmp(&b.violation.metric_name));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelNotifier, NullNotifier};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct StubExecutor {
        calls: AtomicU32,
        failures_before_success: u32,
    }

    impl StubExecutor {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures_before_success: 0,
            })
        }

        fn failing_forever() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures_before_success: u32::MAX,
            })
        }

        fn failing_times(n: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures_before_success: n,
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RollbackExecutor for StubExecutor {
        fn execute_rollback(
            &self,
            _plan: RollbackPlan,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<RollbackOutcome>> + Send>,
        > {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let success = call >= self.failures_before_success;
            Box::pin(async move {
                Ok(RollbackOutcome {
                    success,
                    fallbacks_activated: if success {
                        vec!["traffic-shift".to_string()]
                    } else {
                        Vec::new()
                    },
                })
            })
        }
    }

    fn test_config() -> GuardianConfig {
        GuardianConfig {
            rollback_max_retries: 3,
            rollback_retry_base_ms: 1,
            consultation_timeout_ms: 100,
            representatives: vec!["rep-0".to_string(), "rep-1".to_string()],
            ..GuardianConfig::default()
        }
    }

    fn engine_with(
        executor: Arc<dyn RollbackExecutor>,
        notifier: Arc<dyn Notifier>,
        config: GuardianConfig,
    ) -> (Arc<RollbackDecisionEngine>, Arc<ConsultationCoordinator>) {
        let coordinator = Arc::new(ConsultationCoordinator::new(
            config.quorum_fraction,
            config.approval_threshold,
        ));
        let metrics = Arc::new(GuardianMetrics::new().unwrap());
        let engine = Arc::new(RollbackDecisionEngine::new(
            executor,
            notifier,
            Arc::clone(&coordinator),
            metrics,
            config,
        ));
        (engine, coordinator)
    }

    fn violation(metric: &str, severity: Severity) -> Violation {
        Violation {
            id: Uuid::new_v4(),
            metric_name: metric.to_string(),
            current_value: 0.60,
            threshold: 0.75,
            severity,
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_critical_violation_produces_one_immediate_plan() {
        let executor = StubExecutor::succeeding();
        let (engine, _) = engine_with(executor.clone(), Arc::new(NullNotifier), test_config());

        engine
            .handle(vec![violation("revenue.min_share_ratio", Severity::Critical)])
            .await;

        let status = engine.status().await;
        assert_eq!(status.len(), 1);
        let plan = status[0].plan.as_ref().unwrap();
        assert_eq!(plan.trigger_type, TriggerType::Immediate);
        assert!(plan.executed_at.is_some());
        assert_eq!(
            status[0].state,
            ViolationState::Resolved(Resolution::Rollback)
        );
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_redetection_is_idempotent() {
        let executor = StubExecutor::failing_forever();
        let (engine, _) = engine_with(executor.clone(), Arc::new(NullNotifier), test_config());

        // Unresolved (executor keeps failing), so repeated detections of the
        // same metric must not create additional plans or executions.
        engine
            .handle(vec![violation("revenue.min_share_ratio", Severity::Critical)])
            .await;
        let calls_after_first = executor.call_count();

        engine
            .handle(vec![violation("revenue.min_share_ratio", Severity::Critical)])
            .await;
        engine
            .handle(vec![violation("revenue.min_share_ratio", Severity::Critical)])
            .await;

        assert_eq!(executor.call_count(), calls_after_first);
        let status = engine.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, ViolationState::ImmediateRollback);
    }

    #[tokio::test]
    async fn test_rollback_failure_escalates_and_never_resolves() {
        let executor = StubExecutor::failing_forever();
        let (notifier, mut rx) = ChannelNotifier::new(16);
        let (engine, _) = engine_with(executor.clone(), Arc::new(notifier), test_config());

        engine
            .handle(vec![violation("m", Severity::Critical)])
            .await;

        assert_eq!(executor.call_count(), 3);
        let status = engine.status().await;
        assert_eq!(status[0].state, ViolationState::ImmediateRollback);
        assert!(status[0].plan.as_ref().unwrap().executed_at.is_none());

        let mut saw_fatal = false;
        while let Ok(n) = rx.try_recv() {
            if n.event.kind() == "rollback_failed" {
                saw_fatal = true;
            }
        }
        assert!(saw_fatal);
    }

    #[tokio::test]
    async fn test_rollback_retries_then_succeeds() {
        let executor = StubExecutor::failing_times(2);
        let (engine, _) = engine_with(executor.clone(), Arc::new(NullNotifier), test_config());

        engine
            .handle(vec![violation("m", Severity::Critical)])
            .await;

        assert_eq!(executor.call_count(), 3);
        let status = engine.status().await;
        assert_eq!(
            status[0].state,
            ViolationState::Resolved(Resolution::Rollback)
        );
        assert_eq!(
            status[0].plan.as_ref().unwrap().fallbacks_activated,
            vec!["traffic-shift".to_string()]
        );
    }

    #[tokio::test]
    async fn test_moderate_violation_approved_creates_consultation_plan() {
        let executor = StubExecutor::succeeding();
        let mut config = test_config();
        config.consultation_timeout_ms = 60_000;
        let (engine, coordinator) = engine_with(executor.clone(), Arc::new(NullNotifier), config);

        engine
            .handle(vec![violation("participation.rate", Severity::Moderate)])
            .await;

        let sessions = coordinator.sessions().await;
        assert_eq!(sessions.len(), 1);
        let session_id = sessions[0].id;

        coordinator.cast_vote(session_id, "rep-0", true).await.unwrap();
        coordinator.cast_vote(session_id, "rep-1", true).await.unwrap();

        // Give the spawned decision task a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = engine.status().await;
        let plan = status[0].plan.as_ref().unwrap();
        assert_eq!(plan.trigger_type, TriggerType::ConsultationApproved);
        assert_eq!(
            status[0].state,
            ViolationState::Resolved(Resolution::Consultation)
        );
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_moderate_rejection_resolves_without_plan() {
        let executor = StubExecutor::succeeding();
        let mut config = test_config();
        config.consultation_timeout_ms = 60_000;
        let (engine, coordinator) = engine_with(executor.clone(), Arc::new(NullNotifier), config);

        engine
            .handle(vec![violation("participation.rate", Severity::Moderate)])
            .await;

        let session_id = coordinator.sessions().await[0].id;
        coordinator.cast_vote(session_id, "rep-0", false).await.unwrap();
        coordinator.cast_vote(session_id, "rep-1", false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = engine.status().await;
        assert!(status[0].plan.is_none());
        assert_eq!(
            status[0].state,
            ViolationState::Resolved(Resolution::Consultation)
        );
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_with_rollback_policy_executes_plan() {
        let executor = StubExecutor::succeeding();
        let mut config = test_config();
        config.consultation_timeout_ms = 40;
        config.default_on_timeout = TimeoutPolicy::Rollback;
        let (engine, _) = engine_with(executor.clone(), Arc::new(NullNotifier), config);

        engine
            .handle(vec![violation("participation.rate", Severity::Moderate)])
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        let status = engine.status().await;
        assert_eq!(
            status[0].state,
            ViolationState::Resolved(Resolution::Rollback)
        );
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_with_continue_policy_expires_entry() {
        let executor = StubExecutor::succeeding();
        let mut config = test_config();
        config.consultation_timeout_ms = 40;
        config.default_on_timeout = TimeoutPolicy::Continue;
        let (engine, _) = engine_with(executor.clone(), Arc::new(NullNotifier), config);

        engine
            .handle(vec![violation("participation.rate", Severity::Moderate)])
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        // Entry removed; a fresh detection starts a new cycle.
        assert!(engine.status().await.is_empty());
        assert_eq!(executor.call_count(), 0);

        engine
            .handle(vec![violation("participation.rate", Severity::Moderate)])
            .await;
        assert_eq!(engine.status().await.len(), 1);
    }

    #[tokio::test]
    async fn test_critical_redetection_supersedes_consultation() {
        let executor = StubExecutor::succeeding();
        let mut config = test_config();
        config.consultation_timeout_ms = 60_000;
        let (engine, coordinator) = engine_with(executor.clone(), Arc::new(NullNotifier), config);

        // A moderate violation opens a consultation session.
        engine
            .handle(vec![violation("participation.rate", Severity::Moderate)])
            .await;
        assert_eq!(coordinator.sessions().await.len(), 1);

        // Re-detection at Critical cancels the session and rolls back
        // immediately.
        engine
            .handle(vec![violation("participation.rate", Severity::Critical)])
            .await;

        assert!(coordinator.sessions().await.is_empty());
        let status = engine.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].violation.severity, Severity::Critical);
        assert_eq!(
            status[0].state,
            ViolationState::Resolved(Resolution::Rollback)
        );
        let plan = status[0].plan.as_ref().unwrap();
        assert_eq!(plan.trigger_type, TriggerType::Immediate);
        assert_eq!(executor.call_count(), 1);

        // The orphaned decision task observes the cancellation and must
        // not execute a second rollback.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.call_count(), 1);
    }

    #[test]
    fn test_retry_delay_backoff_is_capped() {
        assert_eq!(retry_delay(100, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(100, 100), Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn test_resolved_violation_can_be_redetected() {
        let executor = StubExecutor::succeeding();
        let (engine, _) = engine_with(executor.clone(), Arc::new(NullNotifier), test_config());

        engine.handle(vec![violation("m", Severity::Critical)]).await;
        assert_eq!(executor.call_count(), 1);

        // Resolved: a new detection starts a new cycle with a new plan.
        engine.handle(vec![violation("m", Severity::Critical)]).await;
        assert_eq!(executor.call_count(), 2);
    }
}
