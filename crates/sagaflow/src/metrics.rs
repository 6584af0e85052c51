//! Prometheus metrics for saga execution.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry,
};

use crate::error::{Error, Result};
use crate::saga::SagaStatus;

const SAGA_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0];
const STEP_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];
const IO_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Saga counters, gauges and histograms registered on one [`Registry`].
///
/// Cloning is cheap; clones update the same series. Registering a second
/// recorder on the same registry fails with [`Error::Metrics`].
///
/// # Example
///
/// ```
/// use prometheus::Registry;
/// use sagaflow::MetricsRecorder;
///
/// let registry = Registry::new();
/// let metrics = MetricsRecorder::new(&registry).unwrap();
/// metrics.saga_started("backtest");
///
/// assert!(metrics.encode().unwrap().contains("saga_started_total"));
/// ```
#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Registry,

    saga_started: IntCounterVec,
    saga_completed: IntCounterVec,
    saga_failed: IntCounterVec,
    saga_aborted: IntCounterVec,
    saga_running: IntGaugeVec,
    saga_duration: HistogramVec,

    step_executed: IntCounterVec,
    step_failed: IntCounterVec,
    step_retry: IntCounterVec,
    step_duration: HistogramVec,

    compensation_executed: IntCounterVec,
    compensation_failed: IntCounterVec,
    compensation_duration: HistogramVec,

    checkpoint_saved: IntCounterVec,
    checkpoint_loaded: IntCounterVec,
    checkpoint_save_duration: HistogramVec,

    audit_written: IntCounterVec,
    audit_write_duration: HistogramVec,
}

impl MetricsRecorder {
    /// Register every saga metric on `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let saga = &["saga_type"];
        let step = &["saga_type", "step_name"];

        Ok(Self {
            registry: registry.clone(),

            saga_started: register_int_counter_vec_with_registry!(
                Opts::new("saga_started_total", "Sagas started"),
                saga,
                registry
            )?,
            saga_completed: register_int_counter_vec_with_registry!(
                Opts::new("saga_completed_total", "Sagas completed successfully"),
                saga,
                registry
            )?,
            saga_failed: register_int_counter_vec_with_registry!(
                Opts::new("saga_failed_total", "Sagas rolled back after a step failure"),
                saga,
                registry
            )?,
            saga_aborted: register_int_counter_vec_with_registry!(
                Opts::new("saga_aborted_total", "Sagas rolled back after an abort request"),
                saga,
                registry
            )?,
            saga_running: register_int_gauge_vec_with_registry!(
                Opts::new("saga_running_current", "Sagas currently executing"),
                saga,
                registry
            )?,
            saga_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new("saga_duration_seconds", "Saga wall time by outcome")
                    .buckets(SAGA_BUCKETS.to_vec()),
                &["saga_type", "status"],
                registry
            )?,

            step_executed: register_int_counter_vec_with_registry!(
                Opts::new("saga_step_executed_total", "Steps completed successfully"),
                step,
                registry
            )?,
            step_failed: register_int_counter_vec_with_registry!(
                Opts::new("saga_step_failed_total", "Steps that exhausted their retries"),
                step,
                registry
            )?,
            step_retry: register_int_counter_vec_with_registry!(
                Opts::new("saga_step_retry_total", "Step attempts retried"),
                step,
                registry
            )?,
            step_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new("saga_step_duration_seconds", "Step wall time including retries")
                    .buckets(STEP_BUCKETS.to_vec()),
                step,
                registry
            )?,

            compensation_executed: register_int_counter_vec_with_registry!(
                Opts::new(
                    "saga_compensation_executed_total",
                    "Compensations completed successfully"
                ),
                step,
                registry
            )?,
            compensation_failed: register_int_counter_vec_with_registry!(
                Opts::new("saga_compensation_failed_total", "Compensations that failed"),
                step,
                registry
            )?,
            compensation_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "saga_compensation_duration_seconds",
                    "Compensation wall time"
                )
                .buckets(STEP_BUCKETS.to_vec()),
                step,
                registry
            )?,

            checkpoint_saved: register_int_counter_vec_with_registry!(
                Opts::new("saga_checkpoint_saved_total", "Checkpoints written"),
                saga,
                registry
            )?,
            checkpoint_loaded: register_int_counter_vec_with_registry!(
                Opts::new("saga_checkpoint_loaded_total", "Checkpoints read for recovery"),
                saga,
                registry
            )?,
            checkpoint_save_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "saga_checkpoint_save_duration_seconds",
                    "Checkpoint write latency"
                )
                .buckets(IO_BUCKETS.to_vec()),
                saga,
                registry
            )?,

            audit_written: register_int_counter_vec_with_registry!(
                Opts::new("saga_audit_log_written_total", "Audit entries written"),
                &["saga_type", "event_type"],
                registry
            )?,
            audit_write_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "saga_audit_log_write_duration_seconds",
                    "Audit entry write latency"
                )
                .buckets(IO_BUCKETS.to_vec()),
                saga,
                registry
            )?,
        })
    }

    pub fn saga_started(&self, saga_type: &str) {
        self.saga_started.with_label_values(&[saga_type]).inc();
    }

    /// Track a running saga until the returned guard is dropped.
    pub fn running(&self, saga_type: &str) -> RunningGuard {
        let gauge = self.saga_running.with_label_values(&[saga_type]);
        gauge.inc();
        RunningGuard { gauge }
    }

    pub fn saga_finished(&self, saga_type: &str, status: SagaStatus, duration: Duration) {
        let counter = match status {
            SagaStatus::Completed => &self.saga_completed,
            SagaStatus::Failed => &self.saga_failed,
            SagaStatus::Aborted => &self.saga_aborted,
        };
        counter.with_label_values(&[saga_type]).inc();
        self.saga_duration
            .with_label_values(&[saga_type, status.as_str()])
            .observe(duration.as_secs_f64());
    }

    pub fn step_executed(&self, saga_type: &str, step_name: &str, duration: Duration) {
        self.step_executed
            .with_label_values(&[saga_type, step_name])
            .inc();
        self.step_duration
            .with_label_values(&[saga_type, step_name])
            .observe(duration.as_secs_f64());
    }

    pub fn step_failed(&self, saga_type: &str, step_name: &str, duration: Duration) {
        self.step_failed
            .with_label_values(&[saga_type, step_name])
            .inc();
        self.step_duration
            .with_label_values(&[saga_type, step_name])
            .observe(duration.as_secs_f64());
    }

    pub fn step_retried(&self, saga_type: &str, step_name: &str) {
        self.step_retry
            .with_label_values(&[saga_type, step_name])
            .inc();
    }

    pub fn compensation_executed(&self, saga_type: &str, step_name: &str, duration: Duration) {
        self.compensation_executed
            .with_label_values(&[saga_type, step_name])
            .inc();
        self.compensation_duration
            .with_label_values(&[saga_type, step_name])
            .observe(duration.as_secs_f64());
    }

    pub fn compensation_failed(&self, saga_type: &str, step_name: &str, duration: Duration) {
        self.compensation_failed
            .with_label_values(&[saga_type, step_name])
            .inc();
        self.compensation_duration
            .with_label_values(&[saga_type, step_name])
            .observe(duration.as_secs_f64());
    }

    pub fn checkpoint_saved(&self, saga_type: &str, duration: Duration) {
        self.checkpoint_saved.with_label_values(&[saga_type]).inc();
        self.checkpoint_save_duration
            .with_label_values(&[saga_type])
            .observe(duration.as_secs_f64());
    }

    pub fn checkpoint_loaded(&self, saga_type: &str) {
        self.checkpoint_loaded.with_label_values(&[saga_type]).inc();
    }

    pub fn audit_written(&self, saga_type: &str, event_type: &str, duration: Duration) {
        self.audit_written
            .with_label_values(&[saga_type, event_type])
            .inc();
        self.audit_write_duration
            .with_label_values(&[saga_type])
            .observe(duration.as_secs_f64());
    }

    /// Render the whole registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder").finish_non_exhaustive()
    }
}

/// Decrements `saga_running_current` when dropped.
#[must_use = "the saga is only counted as running while the guard is alive"]
pub struct RunningGuard {
    gauge: prometheus::IntGauge,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
