//! Monitoring engine
//!
//! Wires the aggregation, classification, and decision stages into the
//! periodic sweep loop: collect health snapshots, classify breaches,
//! hand violations to the rollback decision engine.

pub mod aggregator;
pub mod classifier;
pub mod consultation;
pub mod rollback;
pub mod threshold;

pub use aggregator::{HealthCheckable, MetricsAggregator, UnavailableSource};
pub use classifier::ViolationClassifier;
pub use consultation::{ConsultationCoordinator, SessionTicket};
pub use rollback::{RollbackDecisionEngine, RollbackExecutor};

use crate::breaker::BreakerRegistry;
use crate::contracts::{GuardianConfig, GuardianEvent, Severity, StatusSnapshot, SweepReport};
use crate::notify::Notifier;
use crate::telemetry::GuardianMetrics;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::Duration;
use uuid::Uuid;

/// Periodic compliance sweep over all registered collaborators
pub struct MonitoringEngine {
    aggregator: MetricsAggregator,
    classifier: ViolationClassifier,
    decision: Arc<RollbackDecisionEngine>,
    coordinator: Arc<ConsultationCoordinator>,
    breakers: Arc<BreakerRegistry>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<GuardianMetrics>,
    config: GuardianConfig,
    last_sweep: RwLock<Option<SweepReport>>,
    /// Whether the previous sweep ran with zero reachable sources;
    /// gates the degraded-monitoring alert to the transition.
    was_degraded: AtomicBool,
}

impl MonitoringEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregator: MetricsAggregator,
        classifier: ViolationClassifier,
        decision: Arc<RollbackDecisionEngine>,
        coordinator: Arc<ConsultationCoordinator>,
        breakers: Arc<BreakerRegistry>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<GuardianMetrics>,
        config: GuardianConfig,
    ) -> Self {
        Self {
            aggregator,
            classifier,
            decision,
            coordinator,
            breakers,
            notifier,
            metrics,
            config,
            last_sweep: RwLock::new(None),
            was_degraded: AtomicBool::new(false),
        }
    }

    /// One collect-classify-decide cycle
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let started = tokio::time::Instant::now();
        let aggregate = self.aggregator.collect().await;

        if aggregate.degraded_monitoring
            && !self.was_degraded.swap(true, Ordering::SeqCst)
        {
            self.notifier
                .notify(GuardianEvent::DegradedMonitoring {
                    sources_total: aggregate.sources_total,
                })
                .await;
        } else if !aggregate.degraded_monitoring {
            self.was_degraded.store(false, Ordering::SeqCst);
        }

        let violations = self.classifier.classify(&aggregate);
        let critical_count = violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .count() as u32;
        let moderate_count = violations.len() as u32 - critical_count;

        self.decision.handle(violations.clone()).await;
        self.metrics.record_sweep(aggregate.degraded_monitoring);

        let report = SweepReport {
            sweep_id: Uuid::new_v4(),
            overall_score: aggregate.overall_score,
            sources_available: aggregate.sources_available,
            sources_total: aggregate.sources_total,
            degraded_monitoring: aggregate.degraded_monitoring,
            violations_detected: violations.len() as u32,
            critical_count,
            moderate_count,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };

        tracing::info!(
            sweep_id = %report.sweep_id,
            overall_score = report.overall_score,
            violations = report.violations_detected,
            degraded = report.degraded_monitoring,
            "sweep completed"
        );

        *self.last_sweep.write().await = Some(report.clone());
        report
    }

    /// Run sweeps at the configured interval until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.monitoring_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("monitoring loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Snapshot for the status endpoint. Served even while monitoring
    /// is degraded.
    pub async fn status(&self) -> StatusSnapshot {
        let last_sweep = self.last_sweep.read().await.clone();
        StatusSnapshot {
            violations: self.decision.status().await,
            sessions: self.coordinator.sessions().await,
            breakers: self.breakers.snapshots().await,
            degraded_monitoring: last_sweep
                .as_ref()
                .map(|s| s.degraded_monitoring)
                .unwrap_or(false),
            last_sweep,
            generated_at: Utc::now(),
        }
    }

    pub fn coordinator(&self) -> &Arc<ConsultationCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<GuardianMetrics> {
        &self.metrics
    }
}
