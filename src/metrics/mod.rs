//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for the dispatch
//! pipeline: request latencies, per-phase job timings, queue depth,
//! circuit breaker state, retry counts, and cost efficiency.
//!
//! # Example
//!
//! ```ignore
//! use scalemate::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Create a collector for recording metrics
//! let collector = MetricsCollector::new();
//! collector.record_queue_wait(std::time::Duration::from_millis(40));
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};
