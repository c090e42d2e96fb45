//! Metric recording façade.
//!
//! `MetricsCollector` wraps the raw Prometheus statics and provides
//! convenient, consistently-labeled recording methods for the rest of the
//! codebase. All methods are no-ops until `init_metrics()` has run, so
//! library code never has to care about initialization order.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_JOBS, API_REQUESTS_TOTAL, API_REQUEST_DURATION, API_SUCCESSFUL_OPS, AVERAGE_REPLICAS,
    CIRCUIT_FAILURES, CIRCUIT_STATE, COST_EFFICIENCY, CPU_SECONDS, ENGINE_COMPUTE_TIME,
    ENGINE_CONNECT_TIME, IDLE_PERCENTAGE, IDLE_TIME, QUEUE_DEPTH, QUEUE_DEPTH_STDDEV,
    QUEUE_WAIT_TIME, REPLICA_COUNT, RESULT_PUBLISH_EXHAUSTED, RESULT_PUBLISH_TIME, RETRY_ATTEMPTS,
    SCALING_EVENTS, SCALING_RATIO, TOTAL_PROCESSING_TIME, WORKER_SUCCESSFUL_OPS,
};

/// Metrics collector for recording platform operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new collector. Metrics must be initialized with
    /// `init_metrics()` before any recording takes effect.
    pub fn new() -> Self {
        Self
    }

    /// Record API request duration for an endpoint and status code.
    pub fn record_request_duration(&self, endpoint: &str, status_code: &str, elapsed: Duration) {
        if let Some(hist) = API_REQUEST_DURATION.get() {
            hist.with_label_values(&[endpoint, status_code])
                .observe(elapsed.as_secs_f64());
        }
    }

    /// Count an API request by status code.
    pub fn increment_request_counter(&self, status_code: &str) {
        if let Some(counter) = API_REQUESTS_TOTAL.get() {
            counter.with_label_values(&[status_code]).inc();
        }
    }

    /// Count a completed job observed by the front-end.
    pub fn increment_api_successful_ops(&self) {
        if let Some(counter) = API_SUCCESSFUL_OPS.get() {
            counter.inc();
        }
    }

    /// Set the current queue depth.
    pub fn set_queue_depth(&self, depth: f64) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(depth);
        }
    }

    /// Set the queue depth standard deviation for a window label.
    pub fn set_queue_depth_stddev(&self, window: &str, stddev: f64) {
        if let Some(gauge) = QUEUE_DEPTH_STDDEV.get() {
            gauge.with_label_values(&[window]).set(stddev);
        }
    }

    /// Record how long a job waited in the queue.
    pub fn record_queue_wait(&self, elapsed: Duration) {
        if let Some(hist) = QUEUE_WAIT_TIME.get() {
            hist.observe(elapsed.as_secs_f64());
        }
    }

    /// Record engine TCP connect time.
    pub fn record_engine_connect(&self, elapsed: Duration) {
        if let Some(hist) = ENGINE_CONNECT_TIME.get() {
            hist.observe(elapsed.as_secs_f64());
        }
    }

    /// Record engine computation time.
    pub fn record_engine_compute(&self, elapsed: Duration) {
        if let Some(hist) = ENGINE_COMPUTE_TIME.get() {
            hist.observe(elapsed.as_secs_f64());
        }
    }

    /// Record result publishing time.
    pub fn record_result_publish(&self, elapsed: Duration) {
        if let Some(hist) = RESULT_PUBLISH_TIME.get() {
            hist.observe(elapsed.as_secs_f64());
        }
    }

    /// Record total job processing time.
    pub fn record_total_processing(&self, elapsed: Duration) {
        if let Some(hist) = TOTAL_PROCESSING_TIME.get() {
            hist.observe(elapsed.as_secs_f64());
        }
    }

    /// Add an idle span to the cumulative idle counter.
    pub fn increment_idle_time(&self, elapsed: Duration) {
        if let Some(counter) = IDLE_TIME.get() {
            counter.inc_by(elapsed.as_secs_f64());
        }
    }

    /// Set the worker idle percentage (0-100).
    pub fn set_idle_percentage(&self, percentage: f64) {
        if let Some(gauge) = IDLE_PERCENTAGE.get() {
            gauge.set(percentage);
        }
    }

    /// Set the current number of active jobs.
    pub fn set_active_jobs(&self, count: f64) {
        if let Some(gauge) = ACTIVE_JOBS.get() {
            gauge.set(count);
        }
    }

    /// Count a job completed without error.
    pub fn increment_worker_successful_ops(&self) {
        if let Some(counter) = WORKER_SUCCESSFUL_OPS.get() {
            counter.inc();
        }
    }

    /// Count a result dropped after exhausting publish retries.
    pub fn increment_result_publish_exhausted(&self) {
        if let Some(counter) = RESULT_PUBLISH_EXHAUSTED.get() {
            counter.inc();
        }
    }

    /// Set circuit breaker state (0=closed, 1=half-open, 2=open).
    pub fn set_circuit_breaker_state(&self, service: &str, component: &str, state: f64) {
        if let Some(gauge) = CIRCUIT_STATE.get() {
            gauge.with_label_values(&[service, component]).set(state);
        }
    }

    /// Count a circuit breaker trip.
    pub fn increment_circuit_breaker_failures(&self, service: &str, component: &str) {
        if let Some(counter) = CIRCUIT_FAILURES.get() {
            counter.with_label_values(&[service, component]).inc();
        }
    }

    /// Count a retry attempt. `attempt` is the 1-based attempt number.
    pub fn increment_retry_attempts(&self, service: &str, operation: &str, attempt: u32) {
        if let Some(counter) = RETRY_ATTEMPTS.get() {
            counter
                .with_label_values(&[service, operation, &attempt.to_string()])
                .inc();
        }
    }

    /// Add consumed CPU-seconds.
    pub fn increment_cpu_seconds(&self, seconds: f64) {
        if let Some(counter) = CPU_SECONDS.get() {
            counter.inc_by(seconds);
        }
    }

    /// Set the cost efficiency ratio (operations per CPU-second).
    pub fn set_cost_efficiency(&self, ratio: f64) {
        if let Some(gauge) = COST_EFFICIENCY.get() {
            gauge.set(ratio);
        }
    }

    /// Set the current replica count for a service.
    pub fn set_replica_count(&self, service: &str, count: f64) {
        if let Some(gauge) = REPLICA_COUNT.get() {
            gauge.with_label_values(&[service]).set(count);
        }
    }

    /// Set the 1-hour average replica count for a service.
    pub fn set_average_replicas(&self, service: &str, average: f64) {
        if let Some(gauge) = AVERAGE_REPLICAS.get() {
            gauge.with_label_values(&[service]).set(average);
        }
    }

    /// Count a scaling event ("up" or "down").
    pub fn increment_scaling_events(&self, service: &str, direction: &str) {
        if let Some(counter) = SCALING_EVENTS.get() {
            counter.with_label_values(&[service, direction]).inc();
        }
    }

    /// Set the scale-up to scale-down events ratio for a service.
    pub fn set_scaling_events_ratio(&self, service: &str, ratio: f64) {
        if let Some(gauge) = SCALING_RATIO.get() {
            gauge.with_label_values(&[service]).set(ratio);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::init_metrics;

    #[test]
    fn test_collector_records_without_panicking_before_init() {
        // Recording before initialization must be a silent no-op.
        let collector = MetricsCollector::new();
        collector.record_queue_wait(Duration::from_millis(5));
        collector.set_idle_percentage(42.0);
        collector.increment_retry_attempts("worker", "engine_connect", 2);
    }

    #[test]
    fn test_idle_percentage_gauge_roundtrip() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.set_idle_percentage(73.5);

        if let Some(gauge) = IDLE_PERCENTAGE.get() {
            let value = gauge.get();
            assert!((0.0..=100.0).contains(&value));
        }
    }

    #[test]
    fn test_total_processing_count_tracks_observations() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        let hist = TOTAL_PROCESSING_TIME.get().expect("initialized");
        let before = hist.get_sample_count();
        collector.record_total_processing(Duration::from_millis(1200));
        collector.record_total_processing(Duration::from_millis(800));
        assert_eq!(hist.get_sample_count(), before + 2);
    }
}
