//! Prometheus Metrics Definitions
//!
//! Metrics are registered on a caller-supplied [`Registry`] so separate
//! engines (and tests) never share process-wide state.

use exptflow_core::{ExptStatus, ExptType, ExptflowError, ExptflowResult, ExptRunMode};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Experiment duration buckets (seconds): 1m, 5m, 15m, 1h, 4h, 12h, 1d, 3d
const EXPT_DURATION_BUCKETS: &[f64] = &[
    60.0, 300.0, 900.0, 3600.0, 14_400.0, 43_200.0, 86_400.0, 259_200.0,
];

/// Container for all exptflow metrics.
#[derive(Clone)]
pub struct ExptMetrics {
    /// Runs logged - labels: mode
    pub run_total: IntCounterVec,

    /// Experiment completions - labels: expt_type, status
    pub expt_result_total: IntCounterVec,

    /// Start-to-completion time - labels: expt_type
    pub expt_duration_seconds: HistogramVec,

    /// Target calls - labels: outcome (success/fail/error/skipped/reused)
    pub target_call_total: IntCounterVec,

    /// Evaluator calls - labels: outcome (success/fail/error/reused)
    pub evaluator_call_total: IntCounterVec,

    /// Turn pipeline runs - labels: outcome (ok/eval_err)
    pub turn_eval_total: IntCounterVec,
}

fn register<M>(registry: &Registry, metric: M) -> ExptflowResult<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| ExptflowError::Metrics(e.to_string()))?;
    Ok(metric)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> ExptflowResult<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|e| ExptflowError::Metrics(format!("Failed to create {}: {}", name, e)))
}

impl ExptMetrics {
    /// Create all metrics and register them on `registry`.
    pub fn new(registry: &Registry) -> ExptflowResult<Self> {
        let expt_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "exptflow_expt_duration_seconds",
                "Experiment duration from start to completion in seconds",
            )
            .buckets(EXPT_DURATION_BUCKETS.to_vec()),
            &["expt_type"],
        )
        .map_err(|e| ExptflowError::Metrics(e.to_string()))?;

        Ok(Self {
            run_total: register(
                registry,
                counter_vec("exptflow_run_total", "Total number of runs logged", &["mode"])?,
            )?,
            expt_result_total: register(
                registry,
                counter_vec(
                    "exptflow_expt_result_total",
                    "Total number of experiment completions",
                    &["expt_type", "status"],
                )?,
            )?,
            expt_duration_seconds: register(registry, expt_duration_seconds)?,
            target_call_total: register(
                registry,
                counter_vec(
                    "exptflow_target_call_total",
                    "Total number of per-turn target calls",
                    &["outcome"],
                )?,
            )?,
            evaluator_call_total: register(
                registry,
                counter_vec(
                    "exptflow_evaluator_call_total",
                    "Total number of per-turn evaluator calls",
                    &["outcome"],
                )?,
            )?,
            turn_eval_total: register(
                registry,
                counter_vec(
                    "exptflow_turn_eval_total",
                    "Total number of turn pipeline runs",
                    &["outcome"],
                )?,
            )?,
        })
    }

    pub fn record_run(&self, mode: ExptRunMode) {
        self.run_total.with_label_values(&[mode.as_db_str()]).inc();
    }

    pub fn record_expt_result(&self, expt_type: ExptType, status: ExptStatus, elapsed: Option<Duration>) {
        self.expt_result_total
            .with_label_values(&[expt_type.as_db_str(), status.as_db_str()])
            .inc();
        if let Some(elapsed) = elapsed {
            self.expt_duration_seconds
                .with_label_values(&[expt_type.as_db_str()])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_target_call(&self, outcome: &str) {
        self.target_call_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_evaluator_call(&self, outcome: &str) {
        self.evaluator_call_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_turn_eval(&self, outcome: &str) {
        self.turn_eval_total.with_label_values(&[outcome]).inc();
    }
}

/// Render every metric on `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> ExptflowResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| ExptflowError::Metrics(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| ExptflowError::Metrics(e.to_string()))
}
