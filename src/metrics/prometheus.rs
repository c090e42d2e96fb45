//! Prometheus metric registration and export.
//!
//! This module defines all Prometheus metrics used by the platform and
//! provides functions for initializing, registering, and exporting them.
//! Both processes register the full set; metrics a process never touches
//! simply stay at zero.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all platform metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// API request latency, labeled by endpoint and status code.
pub static API_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total API requests, labeled by status code.
pub static API_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Completed jobs observed by the front-end, for cost tracking.
pub static API_SUCCESSFUL_OPS: OnceLock<Counter> = OnceLock::new();

/// Current pending-job count in the queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Population standard deviation of queue depth, labeled by window.
pub static QUEUE_DEPTH_STDDEV: OnceLock<GaugeVec> = OnceLock::new();

/// Time jobs spend in the queue, from creation to dequeue.
pub static QUEUE_WAIT_TIME: OnceLock<Histogram> = OnceLock::new();

/// Engine TCP connect time.
pub static ENGINE_CONNECT_TIME: OnceLock<Histogram> = OnceLock::new();

/// Engine computation time.
pub static ENGINE_COMPUTE_TIME: OnceLock<Histogram> = OnceLock::new();

/// Result publishing time.
pub static RESULT_PUBLISH_TIME: OnceLock<Histogram> = OnceLock::new();

/// Total job processing time. Its sample count equals the number of jobs
/// whose processing finished (one result published per sample).
pub static TOTAL_PROCESSING_TIME: OnceLock<Histogram> = OnceLock::new();

/// Cumulative seconds the worker spent waiting for jobs.
pub static IDLE_TIME: OnceLock<Counter> = OnceLock::new();

/// Worker idle percentage over its uptime, 0-100.
pub static IDLE_PERCENTAGE: OnceLock<Gauge> = OnceLock::new();

/// Jobs currently being processed by this worker.
pub static ACTIVE_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Jobs completed without error by this worker.
pub static WORKER_SUCCESSFUL_OPS: OnceLock<Counter> = OnceLock::new();

/// Result publishes dropped after exhausting all retries.
pub static RESULT_PUBLISH_EXHAUSTED: OnceLock<Counter> = OnceLock::new();

/// Circuit breaker state: 0=closed, 1=half-open, 2=open.
pub static CIRCUIT_STATE: OnceLock<GaugeVec> = OnceLock::new();

/// Circuit breaker trips, counted on the edge into open.
pub static CIRCUIT_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Retry attempts, labeled by service, operation, and attempt number.
pub static RETRY_ATTEMPTS: OnceLock<CounterVec> = OnceLock::new();

/// Total CPU-seconds consumed by the process.
pub static CPU_SECONDS: OnceLock<Counter> = OnceLock::new();

/// Successful operations per CPU-second.
pub static COST_EFFICIENCY: OnceLock<Gauge> = OnceLock::new();

/// Current replica count by service.
pub static REPLICA_COUNT: OnceLock<GaugeVec> = OnceLock::new();

/// Time-weighted average replicas over a 1-hour window, by service.
pub static AVERAGE_REPLICAS: OnceLock<GaugeVec> = OnceLock::new();

/// Scale-up and scale-down events, by service and direction.
pub static SCALING_EVENTS: OnceLock<CounterVec> = OnceLock::new();

/// Ratio of scale-up to scale-down events, by service.
pub static SCALING_RATIO: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at process startup, before serving traffic. Initialization is
/// idempotent: a second call leaves the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due
/// to duplicate metric names.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let api_request_duration = HistogramVec::new(
        HistogramOpts::new(
            "api_request_duration_seconds",
            "API request latency with percentiles (P50, P95, P99)",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0,
        ]),
        &["endpoint", "status_code"],
    )?;

    let api_requests_total = CounterVec::new(
        Opts::new("api_requests_total", "Total requests by status code"),
        &["status_code"],
    )?;

    let api_successful_ops = Counter::new(
        "api_successful_operations_total",
        "Completed jobs for cost tracking",
    )?;

    let queue_depth = Gauge::new("redis_queue_depth", "Current job queue size")?;

    let queue_depth_stddev = GaugeVec::new(
        Opts::new(
            "redis_queue_depth_stddev",
            "Standard deviation of queue depth over time windows",
        ),
        &["window"],
    )?;

    let queue_wait_time = Histogram::with_opts(
        HistogramOpts::new(
            "worker_queue_wait_seconds",
            "Time jobs spend in queue (creation to dequeue)",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )?;

    let engine_connect_time = Histogram::with_opts(
        HistogramOpts::new("worker_engine_connection_seconds", "Engine connection time")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
    )?;

    let engine_compute_time = Histogram::with_opts(
        HistogramOpts::new("worker_engine_computation_seconds", "Engine computation time")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )?;

    let result_publish_time = Histogram::with_opts(
        HistogramOpts::new("worker_result_publish_seconds", "Result publishing time")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
    )?;

    let total_processing_time = Histogram::with_opts(
        HistogramOpts::new("worker_total_processing_seconds", "Total job processing time")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )?;

    let idle_time = Counter::new("worker_idle_time_seconds", "Time spent waiting for jobs")?;

    let idle_percentage = Gauge::new("worker_idle_percentage", "Idle time percentage (0-100)")?;

    let active_jobs = Gauge::new(
        "worker_active_jobs",
        "Current number of jobs being processed",
    )?;

    let worker_successful_ops = Counter::new(
        "worker_successful_operations_total",
        "Jobs completed without error",
    )?;

    let result_publish_exhausted = Counter::new(
        "worker_result_publish_exhausted_total",
        "Results dropped after exhausting publish retries",
    )?;

    let circuit_state = GaugeVec::new(
        Opts::new(
            "circuit_breaker_state",
            "Circuit breaker state: 0=closed, 1=half-open, 2=open",
        ),
        &["service", "component"],
    )?;

    let circuit_failures = CounterVec::new(
        Opts::new(
            "circuit_breaker_failures_total",
            "Circuit breaker failure counts",
        ),
        &["service", "component"],
    )?;

    let retry_attempts = CounterVec::new(
        Opts::new("retry_attempts_total", "Retry counts by service and reason"),
        &["service", "operation", "attempt_number"],
    )?;

    let cpu_seconds = Counter::new("service_cpu_seconds_total", "Total CPU-seconds consumed")?;

    let cost_efficiency = Gauge::new("cost_efficiency_ratio", "Operations per CPU-second")?;

    let replica_count = GaugeVec::new(
        Opts::new("service_replica_count", "Current replica count by service"),
        &["service"],
    )?;

    let average_replicas = GaugeVec::new(
        Opts::new(
            "service_average_replicas",
            "Average replicas over 1-hour window",
        ),
        &["service"],
    )?;

    let scaling_events = CounterVec::new(
        Opts::new("scaling_events_total", "Scale-up and scale-down events"),
        &["service", "direction"],
    )?;

    let scaling_ratio = GaugeVec::new(
        Opts::new(
            "scaling_events_ratio",
            "Ratio of scale-up events to scale-down events for tuning analysis",
        ),
        &["service"],
    )?;

    registry.register(Box::new(api_request_duration.clone()))?;
    registry.register(Box::new(api_requests_total.clone()))?;
    registry.register(Box::new(api_successful_ops.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(queue_depth_stddev.clone()))?;
    registry.register(Box::new(queue_wait_time.clone()))?;
    registry.register(Box::new(engine_connect_time.clone()))?;
    registry.register(Box::new(engine_compute_time.clone()))?;
    registry.register(Box::new(result_publish_time.clone()))?;
    registry.register(Box::new(total_processing_time.clone()))?;
    registry.register(Box::new(idle_time.clone()))?;
    registry.register(Box::new(idle_percentage.clone()))?;
    registry.register(Box::new(active_jobs.clone()))?;
    registry.register(Box::new(worker_successful_ops.clone()))?;
    registry.register(Box::new(result_publish_exhausted.clone()))?;
    registry.register(Box::new(circuit_state.clone()))?;
    registry.register(Box::new(circuit_failures.clone()))?;
    registry.register(Box::new(retry_attempts.clone()))?;
    registry.register(Box::new(cpu_seconds.clone()))?;
    registry.register(Box::new(cost_efficiency.clone()))?;
    registry.register(Box::new(replica_count.clone()))?;
    registry.register(Box::new(average_replicas.clone()))?;
    registry.register(Box::new(scaling_events.clone()))?;
    registry.register(Box::new(scaling_ratio.clone()))?;

    // Store metrics in static variables.
    // If any of these fail, metrics were already initialized (idempotent).
    let _ = REGISTRY.set(registry);
    let _ = API_REQUEST_DURATION.set(api_request_duration);
    let _ = API_REQUESTS_TOTAL.set(api_requests_total);
    let _ = API_SUCCESSFUL_OPS.set(api_successful_ops);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = QUEUE_DEPTH_STDDEV.set(queue_depth_stddev);
    let _ = QUEUE_WAIT_TIME.set(queue_wait_time);
    let _ = ENGINE_CONNECT_TIME.set(engine_connect_time);
    let _ = ENGINE_COMPUTE_TIME.set(engine_compute_time);
    let _ = RESULT_PUBLISH_TIME.set(result_publish_time);
    let _ = TOTAL_PROCESSING_TIME.set(total_processing_time);
    let _ = IDLE_TIME.set(idle_time);
    let _ = IDLE_PERCENTAGE.set(idle_percentage);
    let _ = ACTIVE_JOBS.set(active_jobs);
    let _ = WORKER_SUCCESSFUL_OPS.set(worker_successful_ops);
    let _ = RESULT_PUBLISH_EXHAUSTED.set(result_publish_exhausted);
    let _ = CIRCUIT_STATE.set(circuit_state);
    let _ = CIRCUIT_FAILURES.set(circuit_failures);
    let _ = RETRY_ATTEMPTS.set(retry_attempts);
    let _ = CPU_SECONDS.set(cpu_seconds);
    let _ = COST_EFFICIENCY.set(cost_efficiency);
    let _ = REPLICA_COUNT.set(replica_count);
    let _ = AVERAGE_REPLICAS.set(average_replicas);
    let _ = SCALING_EVENTS.set(scaling_events);
    let _ = SCALING_RATIO.set(scaling_ratio);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text exposition format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        let first = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());

        // A second call must not panic or clobber the registry.
        let _ = init_metrics();
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }

    #[test]
    fn test_circuit_state_values_are_bounded() {
        let _ = init_metrics();
        let gauge = CIRCUIT_STATE.get().expect("initialized");
        for value in [0.0, 1.0, 2.0] {
            gauge.with_label_values(&["stockfish", "worker"]).set(value);
            let read = gauge.with_label_values(&["stockfish", "worker"]).get();
            assert!((0.0..=2.0).contains(&read));
        }
    }
}
