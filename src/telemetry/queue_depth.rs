//! Queue depth sampling and variance windows.
//!
//! The front-end samples the pending-job count every 15 seconds into a ring
//! buffer of the last 240 samples (one hour), updates the depth gauge, and
//! publishes the population standard deviation over 5, 15, and 60 minute
//! sub-windows. The scaling controller uses the spread to distinguish
//! steady load from bursts.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::metrics::MetricsCollector;
use crate::queue::JobQueue;

/// Sampling interval.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Ring buffer capacity: one hour of 15-second samples.
pub const CAPACITY: usize = 240;

/// Windows reported on the stddev gauge, as (label, length).
pub const WINDOWS: [(&str, Duration); 3] = [
    ("5m", Duration::from_secs(300)),
    ("15m", Duration::from_secs(900)),
    ("60m", Duration::from_secs(3600)),
];

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    depth: f64,
}

/// Periodic queue-depth sampler with windowed standard deviation.
pub struct QueueDepthSampler {
    queue: JobQueue,
    collector: MetricsCollector,
    samples: RwLock<VecDeque<Sample>>,
}

impl QueueDepthSampler {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            collector: MetricsCollector::new(),
            samples: RwLock::new(VecDeque::with_capacity(CAPACITY)),
        }
    }

    /// Spawns the sampling task. It ticks every 15 s until shutdown.
    pub fn spawn(self, shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = interval.tick() => {
                        match self.queue.depth().await {
                            Ok(depth) => self.record(depth as f64),
                            Err(e) => warn!(error = %e, "queue depth sample failed"),
                        }
                    }
                }
            }
        })
    }

    fn record(&self, depth: f64) {
        self.collector.set_queue_depth(depth);

        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        if samples.len() == CAPACITY {
            samples.pop_front();
        }
        samples.push_back(Sample {
            at: Instant::now(),
            depth,
        });

        let now = Instant::now();
        for (label, window) in WINDOWS {
            let values: Vec<f64> = samples
                .iter()
                .filter(|s| now.duration_since(s.at) <= window)
                .map(|s| s.depth)
                .collect();
            self.collector
                .set_queue_depth_stddev(label, population_stddev(&values));
        }
    }
}

/// Population standard deviation. Empty input reports zero.
pub fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stddev_empty() {
        assert_eq!(population_stddev(&[]), 0.0);
    }

    #[test]
    fn test_stddev_constant_series() {
        assert_eq!(population_stddev(&[4.0, 4.0, 4.0, 4.0]), 0.0);
    }

    #[test]
    fn test_stddev_known_value() {
        // Population stddev of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2.
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((population_stddev(&values) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_stddev_single_sample() {
        assert_eq!(population_stddev(&[17.0]), 0.0);
    }

    #[test]
    fn test_window_labels() {
        let labels: Vec<&str> = WINDOWS.iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, vec!["5m", "15m", "60m"]);
        assert_eq!(CAPACITY, 240);
    }
}
