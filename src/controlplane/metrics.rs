//! Control Plane Metrics
//!
//! Prometheus collectors registered into an explicit [`Registry`] that the
//! metrics server gathers from.

use crate::apierror::ErrorCode;
use crate::domain::OperationKind;
use crate::error::{Error, Result};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Duration;

const NAMESPACE: &str = "declarative_control_plane";

/// Outcome label of a finished operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Panicked,
    /// Lost the terminal write to a newer transition
    Superseded,
}

impl OperationOutcome {
    fn as_str(self) -> &'static str {
        match self {
            OperationOutcome::Succeeded => "succeeded",
            OperationOutcome::Failed => "failed",
            OperationOutcome::TimedOut => "timed_out",
            OperationOutcome::Panicked => "panicked",
            OperationOutcome::Superseded => "superseded",
        }
    }
}

#[derive(Clone)]
pub struct ControlPlaneMetrics {
    operations_dispatched: IntCounterVec,
    operations_completed: IntCounterVec,
    operations_preempted: IntCounter,
    operations_running: IntGauge,
    plugin_call_duration: HistogramVec,
    api_errors: IntCounterVec,
}

fn register_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl ControlPlaneMetrics {
    /// Create the collectors and register them into `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let operations_dispatched = IntCounterVec::new(
            Opts::new("operations_dispatched_total", "Operations handed to the worker pool")
                .namespace(NAMESPACE),
            &["kind"],
        )
        .map_err(register_err)?;
        let operations_completed = IntCounterVec::new(
            Opts::new("operations_completed_total", "Operations finished by the worker pool")
                .namespace(NAMESPACE),
            &["kind", "outcome"],
        )
        .map_err(register_err)?;
        let operations_preempted = IntCounter::with_opts(
            Opts::new(
                "operations_preempted_total",
                "In-flight packages failed by the recovery sweep",
            )
            .namespace(NAMESPACE),
        )
        .map_err(register_err)?;
        let operations_running = IntGauge::with_opts(
            Opts::new("operations_running", "Operations currently executing")
                .namespace(NAMESPACE),
        )
        .map_err(register_err)?;
        let plugin_call_duration = HistogramVec::new(
            HistogramOpts::new("plugin_call_duration_seconds", "Latency of provider plugin calls")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["provider_type", "call"],
        )
        .map_err(register_err)?;
        let api_errors = IntCounterVec::new(
            Opts::new("api_errors_total", "Error responses by code").namespace(NAMESPACE),
            &["code"],
        )
        .map_err(register_err)?;

        registry
            .register(Box::new(operations_dispatched.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(operations_completed.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(operations_preempted.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(operations_running.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(plugin_call_duration.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(api_errors.clone()))
            .map_err(register_err)?;

        Ok(Self {
            operations_dispatched,
            operations_completed,
            operations_preempted,
            operations_running,
            plugin_call_duration,
            api_errors,
        })
    }

    pub fn record_dispatched(&self, kind: OperationKind) {
        self.operations_dispatched
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn record_started(&self) {
        self.operations_running.inc();
    }

    pub fn record_completed(&self, kind: OperationKind, outcome: OperationOutcome) {
        self.operations_running.dec();
        self.operations_completed
            .with_label_values(&[&kind.to_string(), outcome.as_str()])
            .inc();
    }

    pub fn record_preempted(&self) {
        self.operations_preempted.inc();
    }

    pub fn observe_plugin_call(&self, provider_type: &str, call: &str, elapsed: Duration) {
        self.plugin_call_duration
            .with_label_values(&[provider_type, call])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_api_error(&self, code: ErrorCode) {
        self.api_errors.with_label_values(&[code.as_str()]).inc();
    }

    pub fn dispatched(&self, kind: OperationKind) -> u64 {
        self.operations_dispatched
            .with_label_values(&[&kind.to_string()])
            .get()
    }

    pub fn completed(&self, kind: OperationKind, outcome: OperationOutcome) -> u64 {
        self.operations_completed
            .with_label_values(&[&kind.to_string(), outcome.as_str()])
            .get()
    }

    pub fn preempted(&self) -> u64 {
        self.operations_preempted.get()
    }

    pub fn api_errors(&self, code: ErrorCode) -> u64 {
        self.api_errors.with_label_values(&[code.as_str()]).get()
    }
}

impl std::fmt::Debug for ControlPlaneMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_exported() {
        let registry = Registry::new();
        let metrics = ControlPlaneMetrics::new(&registry).unwrap();

        metrics.record_dispatched(OperationKind::Apply);
        metrics.record_started();
        metrics.record_completed(OperationKind::Apply, OperationOutcome::Succeeded);
        metrics.record_api_error(ErrorCode::Conflict);
        metrics.observe_plugin_call("kubernetes", "apply", Duration::from_millis(20));

        assert_eq!(metrics.dispatched(OperationKind::Apply), 1);
        assert_eq!(
            metrics.completed(OperationKind::Apply, OperationOutcome::Succeeded),
            1
        );

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"declarative_control_plane_api_errors_total".to_string()));
        assert!(names
            .contains(&"declarative_control_plane_plugin_call_duration_seconds".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        ControlPlaneMetrics::new(&registry).unwrap();
        assert!(ControlPlaneMetrics::new(&registry).is_err());
    }
}
