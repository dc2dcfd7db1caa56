//! Prometheus metrics
//!
//! Counters and gauges for the monitoring loop, rollback outcomes,
//! consultation resolutions, and circuit breaker transitions. Exposed
//! through the `/metrics` endpoint.

use prometheus::{CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use thiserror::Error;

/// Telemetry errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Guardian metrics registry
pub struct GuardianMetrics {
    registry: Arc<Registry>,

    /// Monitoring sweeps completed (by result: ok | degraded)
    sweeps_total: CounterVec,

    /// Violations detected (by severity)
    violations_total: CounterVec,

    /// Rollback executions (by trigger, result)
    rollbacks_total: CounterVec,

    /// Consultation resolutions (by outcome)
    consultations_total: CounterVec,

    /// Breaker state transitions (by dependency, transition)
    breaker_transitions_total: CounterVec,

    /// Fallback responses served (by dependency)
    fallbacks_total: CounterVec,

    /// Violations currently unresolved
    active_violations: Gauge,
}

impl GuardianMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let sweeps_total = CounterVec::new(
            Opts::new("sweeps_total", "Monitoring sweeps completed")
                .namespace("compliance_guardian"),
            &["result"],
        )?;

        let violations_total = CounterVec::new(
            Opts::new("violations_total", "Threshold violations detected")
                .namespace("compliance_guardian"),
            &["severity"],
        )?;

        let rollbacks_total = CounterVec::new(
            Opts::new("rollbacks_total", "Rollback plan executions")
                .namespace("compliance_guardian"),
            &["trigger", "result"],
        )?;

        let consultations_total = CounterVec::new(
            Opts::new("consultations_total", "Consultation session resolutions")
                .namespace("compliance_guardian"),
            &["outcome"],
        )?;

        let breaker_transitions_total = CounterVec::new(
            Opts::new("breaker_transitions_total", "Circuit breaker state transitions")
                .namespace("compliance_guardian"),
            &["dependency", "transition"],
        )?;

        let fallbacks_total = CounterVec::new(
            Opts::new("fallbacks_total", "Fallback responses served")
                .namespace("compliance_guardian"),
            &["dependency"],
        )?;

        let active_violations = Gauge::new(
            "compliance_guardian_active_violations",
            "Violations currently unresolved",
        )?;

        registry.register(Box::new(sweeps_total.clone()))?;
        registry.register(Box::new(violations_total.clone()))?;
        registry.register(Box::new(rollbacks_total.clone()))?;
        registry.register(Box::new(consultations_total.clone()))?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;
        registry.register(Box::new(active_violations.clone()))?;

        Ok(Self {
            registry,
            sweeps_total,
            violations_total,
            rollbacks_total,
            consultations_total,
            breaker_transitions_total,
            fallbacks_total,
            active_violations,
        })
    }

    pub fn record_sweep(&self, degraded: bool) {
        let result = if degraded { "degraded" } else { "ok" };
        self.sweeps_total.with_label_values(&[result]).inc();
    }

    pub fn record_violation(&self, severity: &str) {
        self.violations_total.with_label_values(&[severity]).inc();
    }

    pub fn record_rollback(&self, trigger: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.rollbacks_total
            .with_label_values(&[trigger, result])
            .inc();
    }

    pub fn record_consultation(&self, outcome: &str) {
        self.consultations_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_breaker_transition(&self, dependency: &str, transition: &str) {
        self.breaker_transitions_total
            .with_label_values(&[dependency, transition])
            .inc();
    }

    pub fn record_fallback(&self, dependency: &str) {
        self.fallbacks_total.with_label_values(&[dependency]).inc();
    }

    pub fn set_active_violations(&self, count: usize) {
        self.active_violations.set(count as f64);
    }

    /// Render the registry in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| TelemetryError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Encoding(e.to_string()))
    }
}
