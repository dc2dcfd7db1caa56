//! Metric aggregation
//!
//! Collects health-check snapshots from named collaborators under a
//! bounded timeout. Partial availability degrades the aggregate score,
//! it never fails the aggregation: unreachable sources contribute their
//! documented conservative default instead.

use crate::contracts::{AggregateResult, HealthReport, MetricSnapshot, AVAILABILITY_METRIC};
use crate::error::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Capability interface for collaborators that can be health-checked.
///
/// The registry is typed; tests inject [`UnavailableSource`] instead of
/// relying on runtime null guards.
pub trait HealthCheckable: Send + Sync {
    /// Collaborator identifier
    fn id(&self) -> &str;

    /// Score substituted when this source fails or times out.
    /// Documented per source; defaults to a neutral 0.5.
    fn conservative_default(&self) -> f64 {
        0.5
    }

    /// Perform the health check
    fn health_check(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<HealthReport>> + Send>>;
}

/// Default no-op collaborator: always unavailable. Injected in tests in
/// place of absent services.
pub struct UnavailableSource {
    id: String,
}

impl UnavailableSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl HealthCheckable for UnavailableSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn health_check(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<HealthReport>> + Send>> {
        let source_id = self.id.clone();
        Box::pin(async move {
            Err(crate::error::GuardianError::SourceUnavailable {
                source_id,
                reason: "no-op source".to_string(),
            })
        })
    }
}

/// Collects and aggregates collaborator health snapshots
pub struct MetricsAggregator {
    sources: Vec<Arc<dyn HealthCheckable>>,
    /// Per-source weights; sources without an entry weigh 1.0
    weights: HashMap<String, f64>,
    check_timeout: Duration,
    safe_floor: f64,
}

impl MetricsAggregator {
    pub fn new(check_timeout: Duration, safe_floor: f64) -> Self {
        Self {
            sources: Vec::new(),
            weights: HashMap::new(),
            check_timeout,
            safe_floor,
        }
    }

    /// Register a collaborator
    pub fn register(&mut self, source: Arc<dyn HealthCheckable>) {
        self.sources.push(source);
    }

    /// Override the weight for a source (default 1.0)
    pub fn set_weight(&mut self, source_id: impl Into<String>, weight: f64) {
        self.weights.insert(source_id.into(), weight);
    }

    pub fn sources_total(&self) -> u32 {
        self.sources.len() as u32
    }

    /// Run all health checks in parallel and aggregate.
    ///
    /// Never fails: per-source errors and timeouts substitute the
    /// source's conservative default. With zero reachable sources the
    /// overall score is the configured safe floor and the result is
    /// flagged `degraded_monitoring`.
    pub async fn collect(&self) -> AggregateResult {
        let futures: Vec<_> = self
            .sources
            .iter()
            .map(|source| self.check_source(Arc::clone(source)))
            .collect();

        let outcomes = futures::future::join_all(futures).await;

        let mut per_source_scores = HashMap::new();
        let mut metric_samples: HashMap<String, Vec<f64>> = HashMap::new();
        let mut snapshots = Vec::new();
        let mut sources_available = 0u32;

        for (source_id, default, outcome) in outcomes {
            match outcome {
                Some(report) => {
                    sources_available += 1;
                    per_source_scores.insert(source_id.clone(), report.health_score.clamp(0.0, 1.0));
                    for (name, value) in report.metrics {
                        snapshots.push(MetricSnapshot::observed(&source_id, &name, value));
                        metric_samples.entry(name).or_default().push(value);
                    }
                }
                None => {
                    snapshots.push(MetricSnapshot::substituted(
                        &source_id,
                        "health.score",
                        default,
                    ));
                    per_source_scores.insert(source_id, default);
                }
            }
        }

        let sources_total = self.sources.len() as u32;
        // An empty registry is degraded too: nothing is being observed.
        let degraded_monitoring = sources_available == 0;

        let overall_score = if degraded_monitoring {
            self.safe_floor
        } else {
            self.weighted_mean(&per_source_scores)
        };

        let mut metrics: HashMap<String, f64> = metric_samples
            .into_iter()
            .map(|(name, samples)| {
                let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                (name, mean)
            })
            .collect();

        let availability = if sources_total == 0 {
            0.0
        } else {
            sources_available as f64 / sources_total as f64
        };
        metrics.insert(AVAILABILITY_METRIC.to_string(), availability);

        AggregateResult {
            per_source_scores,
            metrics,
            snapshots,
            overall_score,
            sources_available,
            sources_total,
            degraded_monitoring,
            collected_at: Utc::now(),
        }
    }

    /// Check one source under the bounded timeout
    async fn check_source(
        &self,
        source: Arc<dyn HealthCheckable>,
    ) -> (String, f64, Option<HealthReport>) {
        let id = source.id().to_string();
        let default = source.conservative_default();
        match timeout(self.check_timeout, source.health_check()).await {
            Ok(Ok(report)) => (id, default, Some(report)),
            Ok(Err(e)) => {
                tracing::warn!(source = %id, error = %e, "health check failed, substituting conservative default");
                (id, default, None)
            }
            Err(_) => {
                tracing::warn!(
                    source = %id,
                    timeout_ms = self.check_timeout.as_millis() as u64,
                    "health check timed out, substituting conservative default"
                );
                (id, default, None)
            }
        }
    }

    fn weighted_mean(&self, scores: &HashMap<String, f64>) -> f64 {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (source_id, score) in scores {
            let weight = self.weights.get(source_id).copied().unwrap_or(1.0);
            weighted_sum += weight * score;
            weight_total += weight;
        }
        if weight_total <= 0.0 {
            self.safe_floor
        } else {
            weighted_sum / weight_total
        }
    }
}
