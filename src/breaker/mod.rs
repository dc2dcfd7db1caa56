//! Circuit breaker
//!
//! Per-dependency CLOSED / OPEN / HALF_OPEN protection around outbound
//! calls. State transitions are serialized per breaker under a single
//! lock; the protected calls themselves run outside it, so a slow
//! dependency never blocks other callers' admission decisions. While
//! HALF_OPEN exactly one probe is in flight and every other caller is
//! served a fallback.

pub mod fallback;

pub use fallback::{FallbackResponder, InvariantFallbackGenerator, ReplayQueue};

use crate::contracts::{
    BreakerCallStats, BreakerSnapshot, CircuitState, FallbackResponse, GuardianConfig,
    GuardianEvent, QueuedIntent,
};
use crate::error::Result;
use crate::notify::{Notifier, NullNotifier};
use crate::telemetry::GuardianMetrics;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// What a protected call produced
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// The dependency answered
    Real(T),
    /// The breaker served a degraded response instead
    Fallback(FallbackResponse),
}

impl<T> CallOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, CallOutcome::Fallback(_))
    }
}

/// Admission decision taken under the core lock
enum Admission {
    Normal,
    Probe,
    ShortCircuit,
}

struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<chrono::DateTime<Utc>>,
    probe_inflight: bool,
    /// When the in-flight probe was admitted. A probe whose future was
    /// dropped before reporting back would otherwise hold the slot
    /// forever; `admit` reclaims the slot once this is older than
    /// `open_timeout`.
    probe_started_at: Option<Instant>,
    stats: BreakerCallStats,
}

/// One dependency's breaker
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_timeout: Duration,
    core: Mutex<BreakerCore>,
    responder: Arc<dyn FallbackResponder>,
    replay: ReplayQueue,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<GuardianMetrics>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: &GuardianConfig,
        responder: Arc<dyn FallbackResponder>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<GuardianMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            open_timeout: Duration::from_millis(config.open_timeout_ms),
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_wall: None,
                probe_inflight: false,
                probe_started_at: None,
                stats: BreakerCallStats::default(),
            }),
            responder,
            replay: ReplayQueue::new(),
            notifier,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one protected call.
    ///
    /// CLOSED and probe calls execute the future; their failures
    /// propagate to the caller after the breaker accounts for them.
    /// Short-circuited calls never touch the dependency and return a
    /// fallback.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<CallOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit().await;

        match admission {
            Admission::ShortCircuit => Ok(CallOutcome::Fallback(self.serve_fallback().await)),
            Admission::Normal => match call().await {
                Ok(value) => {
                    self.on_success(false).await;
                    Ok(CallOutcome::Real(value))
                }
                Err(e) => {
                    self.on_failure(false).await;
                    Err(e)
                }
            },
            Admission::Probe => match call().await {
                Ok(value) => {
                    self.on_success(true).await;
                    Ok(CallOutcome::Real(value))
                }
                Err(e) => {
                    self.on_failure(true).await;
                    Err(e)
                }
            },
        }
    }

    /// Decide whether this call goes through, probes, or short-circuits
    async fn admit(&self) -> Admission {
        let mut core = self.core.lock().await;
        core.stats.total_calls += 1;

        match core.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let elapsed = core
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.open_timeout {
                    core.state = CircuitState::HalfOpen;
                    core.probe_inflight = true;
                    core.probe_started_at = Some(Instant::now());
                    self.metrics
                        .record_breaker_transition(&self.name, "open_to_half_open");
                    tracing::info!(dependency = %self.name, "breaker half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::ShortCircuit
                }
            }
            CircuitState::HalfOpen => {
                let probe_stale = core
                    .probe_started_at
                    .map(|t| t.elapsed() >= self.open_timeout)
                    .unwrap_or(true);
                if core.probe_inflight && !probe_stale {
                    Admission::ShortCircuit
                } else {
                    if core.probe_inflight {
                        tracing::warn!(dependency = %self.name, "probe abandoned without reporting back, slot reclaimed");
                    }
                    core.probe_inflight = true;
                    core.probe_started_at = Some(Instant::now());
                    Admission::Probe
                }
            }
        }
    }

    async fn on_success(&self, probe: bool) {
        {
            let mut core = self.core.lock().await;
            core.stats.successes += 1;
            core.consecutive_failures = 0;
            if !probe {
                return;
            }

            core.state = CircuitState::Closed;
            core.probe_inflight = false;
            core.probe_started_at = None;
            core.opened_at = None;
            core.opened_at_wall = None;
            self.metrics
                .record_breaker_transition(&self.name, "half_open_to_closed");
        }

        let queued = self.replay.len().await as u32;

        tracing::info!(dependency = %self.name, queued_intents = queued, "breaker recovered");
        self.notifier
            .notify(GuardianEvent::BreakerRecovered {
                dependency: self.name.clone(),
                queued_intents: queued,
            })
            .await;
    }

    async fn on_failure(&self, probe: bool) {
        let opened_after = {
            let mut core = self.core.lock().await;
            core.stats.failures += 1;

            if probe {
                // Failed probe: straight back to OPEN, full timeout again.
                core.state = CircuitState::Open;
                core.probe_inflight = false;
                core.probe_started_at = None;
                core.opened_at = Some(Instant::now());
                core.opened_at_wall = Some(Utc::now());
                core.stats.open_transitions += 1;
                self.metrics
                    .record_breaker_transition(&self.name, "half_open_to_open");
                tracing::warn!(dependency = %self.name, "probe failed, breaker re-opened");
                return;
            }

            core.consecutive_failures += 1;
            if core.state == CircuitState::Closed
                && core.consecutive_failures >= self.failure_threshold
            {
                core.state = CircuitState::Open;
                core.opened_at = Some(Instant::now());
                core.opened_at_wall = Some(Utc::now());
                core.stats.open_transitions += 1;
                self.metrics
                    .record_breaker_transition(&self.name, "closed_to_open");
                Some(core.consecutive_failures)
            } else {
                None
            }
        };

        if let Some(consecutive_failures) = opened_after {
            tracing::warn!(
                dependency = %self.name,
                consecutive_failures,
                "breaker opened"
            );
            self.notifier
                .notify(GuardianEvent::BreakerOpened {
                    dependency: self.name.clone(),
                    consecutive_failures,
                })
                .await;
        }
    }

    async fn serve_fallback(&self) -> FallbackResponse {
        {
            let mut core = self.core.lock().await;
            core.stats.fallback_invocations += 1;
        }
        self.metrics.record_fallback(&self.name);
        self.responder.respond(&self.name)
    }

    /// Park a state-changing intent for replay after recovery
    pub async fn queue_intent(&self, intent: serde_json::Value) -> Uuid {
        self.replay.enqueue(&self.name, intent).await
    }

    /// Take the queued intents, in arrival order, for replay
    pub async fn drain_queued(&self) -> Vec<QueuedIntent> {
        self.replay.drain().await
    }

    pub async fn state(&self) -> CircuitState {
        self.core.lock().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let core = self.core.lock().await;
        let next_probe_at = match core.state {
            CircuitState::Open => core.opened_at_wall.map(|opened| {
                opened
                    + chrono::Duration::from_std(self.open_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero())
            }),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            opened_at: core.opened_at_wall,
            next_probe_at,
            stats: core.stats,
        }
    }
}

/// Owns one breaker per protected dependency
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: GuardianConfig,
    responder: Arc<dyn FallbackResponder>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<GuardianMetrics>,
}

impl BreakerRegistry {
    pub fn new(config: GuardianConfig, metrics: Arc<GuardianMetrics>) -> Self {
        Self::with_parts(
            config,
            Arc::new(InvariantFallbackGenerator::new()),
            Arc::new(NullNotifier),
            metrics,
        )
    }

    pub fn with_parts(
        config: GuardianConfig,
        responder: Arc<dyn FallbackResponder>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<GuardianMetrics>,
    ) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            responder,
            notifier,
            metrics,
        }
    }

    /// Fetch or lazily create the breaker for a dependency
    pub async fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(dependency) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().await;
        // Re-check after upgrading: another caller may have raced us.
        if let Some(breaker) = breakers.get(dependency) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(
            dependency,
            &self.config,
            Arc::clone(&self.responder),
            Arc::clone(&self.notifier),
            Arc::clone(&self.metrics),
        ));
        breakers.insert(dependency.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Snapshot of every breaker for the monitoring endpoint
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::TimeoutPolicy;
    use crate::error::GuardianError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure_threshold: u32, open_timeout_ms: u64) -> GuardianConfig {
        GuardianConfig {
            failure_threshold,
            open_timeout_ms,
            default_on_timeout: TimeoutPolicy::Rollback,
            ..GuardianConfig::default()
        }
    }

    fn breaker(failure_threshold: u32, open_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "revenue-calc",
            &config(failure_threshold, open_timeout_ms),
            Arc::new(InvariantFallbackGenerator::new()),
            Arc::new(NullNotifier),
            Arc::new(GuardianMetrics::new().unwrap()),
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let result = breaker
            .execute(|| async {
                Err::<(), _>(GuardianError::DependencyUnavailable(
                    "revenue-calc".to_string(),
                ))
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_closed_passes_calls_through() {
        let breaker = breaker(5, 1000);
        let outcome = breaker.execute(|| async { Ok(42) }).await.unwrap();
        assert!(matches!(outcome, CallOutcome::Real(42)));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_consecutive_failures() {
        let breaker = breaker(5, 60_000);
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let breaker = breaker(3, 60_000);
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        // Streak restarted at the success: still two failures, not four.
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_short_circuits_without_touching_dependency() {
        let breaker = breaker(2, 60_000);
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        let touched = AtomicU32::new(0);
        let outcome = breaker
            .execute(|| {
                touched.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(touched.load(Ordering::SeqCst), 0);
        match outcome {
            CallOutcome::Fallback(response) => {
                assert!(response.degraded);
                assert_eq!(response.dependency, "revenue-calc");
            }
            CallOutcome::Real(_) => panic!("expected fallback"),
        }
    }

    #[tokio::test]
    async fn test_single_probe_after_open_timeout() {
        let breaker = Arc::new(breaker(1, 40));
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // First caller after the timeout becomes the probe; it holds the
        // slot while a concurrent caller must be short-circuited.
        let probe_breaker = Arc::clone(&breaker);
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("probed")
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        let concurrent = breaker.execute(|| async { Ok("real") }).await.unwrap();
        assert!(concurrent.is_degraded());

        let outcome = probe.await.unwrap().unwrap();
        assert!(matches!(outcome, CallOutcome::Real("probed")));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_probe_slot_is_reclaimed() {
        let breaker = Arc::new(breaker(1, 40));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The admitted probe is cancelled before it can report back.
        let probe_breaker = Arc::clone(&breaker);
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        probe.abort();

        // While the slot is fresh other callers still short-circuit.
        let outcome = breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert!(outcome.is_degraded());

        // Once the slot is older than the open timeout the next caller
        // takes over as the probe; the breaker must not stay wedged.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = breaker.execute(|| async { Ok("recovered") }).await.unwrap();
        assert!(matches!(outcome, CallOutcome::Real("recovered")));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_for_full_timeout() {
        let breaker = breaker(1, 40);
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        fail(&breaker).await; // the probe
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Immediately after the failed probe calls still short-circuit.
        let outcome = breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert!(outcome.is_degraded());
    }

    #[tokio::test]
    async fn test_queued_intents_survive_until_recovery() {
        let breaker = breaker(1, 40);
        fail(&breaker).await;

        breaker.queue_intent(json!({ "op": "payout" })).await;
        breaker.queue_intent(json!({ "op": "adjust" })).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let drained = breaker.drain_queued().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].intent["op"], "payout");
    }

    #[tokio::test]
    async fn test_stats_account_every_call() {
        let breaker = breaker(2, 60_000);
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok(()) }).await.unwrap(); // fallback

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.stats.total_calls, 4);
        assert_eq!(snapshot.stats.successes, 1);
        assert_eq!(snapshot.stats.failures, 2);
        assert_eq!(snapshot.stats.open_transitions, 1);
        assert_eq!(snapshot.stats.fallback_invocations, 1);
        assert!(snapshot.next_probe_at.is_some());
    }

    #[tokio::test]
    async fn test_breaker_opened_event_emitted() {
        let (notifier, mut rx) = crate::notify::ChannelNotifier::new(8);
        let breaker = CircuitBreaker::new(
            "revenue-calc",
            &config(1, 60_000),
            Arc::new(InvariantFallbackGenerator::new()),
            Arc::new(notifier),
            Arc::new(GuardianMetrics::new().unwrap()),
        );
        fail(&breaker).await;

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event.kind(), "breaker_opened");
    }

    #[tokio::test]
    async fn test_registry_returns_same_breaker_per_dependency() {
        let registry = BreakerRegistry::new(
            config(5, 1000),
            Arc::new(GuardianMetrics::new().unwrap()),
        );
        let a = registry.get_or_create("revenue-calc").await;
        let b = registry.get_or_create("revenue-calc").await;
        assert!(Arc::ptr_eq(&a, &b));

        registry.get_or_create("payout-svc").await;
        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "payout-svc");
    }
}
