//! Idle and processing time accounting.
//!
//! The worker records every span it spends blocked on the queue (idle) and
//! every span spent processing a job. A 10-second sampler derives the idle
//! percentage, `100 * total_idle / uptime`, clamped to [0, 100], and exposes
//! it as a gauge. An external scaling controller reads this to decide when
//! workers are underutilised.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::metrics::MetricsCollector;

/// Sampling interval for the idle percentage gauge.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    idle: Duration,
    processing: Duration,
}

/// Accumulates idle and processing spans since worker start.
pub struct IdleTracker {
    started: Instant,
    totals: Mutex<Totals>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Records a span spent waiting for work.
    pub fn record_idle(&self, span: Duration) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.idle += span;
    }

    /// Records a span spent processing a job.
    pub fn record_processing(&self, span: Duration) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.processing += span;
    }

    /// Idle percentage over uptime so far, clamped to [0, 100].
    pub fn idle_percentage(&self) -> f64 {
        let totals = *self.totals.lock().unwrap_or_else(|e| e.into_inner());
        idle_percentage_for(totals.idle, self.started.elapsed())
    }

    /// (idle, processing, uptime) snapshot for logging.
    pub fn snapshot(&self) -> (Duration, Duration, Duration) {
        let totals = *self.totals.lock().unwrap_or_else(|e| e.into_inner());
        (totals.idle, totals.processing, self.started.elapsed())
    }

    /// Spawns the periodic gauge updater.
    pub fn spawn_sampler(self: Arc<Self>, shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let collector = MetricsCollector::new();
            let mut shutdown_rx = shutdown.subscribe();
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = interval.tick() => {
                        let percentage = self.idle_percentage();
                        collector.set_idle_percentage(percentage);

                        let (idle, processing, uptime) = self.snapshot();
                        info!(
                            idle_percentage = percentage,
                            total_idle_seconds = idle.as_secs_f64(),
                            total_process_seconds = processing.as_secs_f64(),
                            total_uptime_seconds = uptime.as_secs_f64(),
                            "idle time statistics"
                        );
                    }
                }
            }
        })
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// `100 * idle / uptime`, clamped to [0, 100]. Zero uptime reports zero.
pub fn idle_percentage_for(idle: Duration, uptime: Duration) -> f64 {
    if uptime.is_zero() {
        return 0.0;
    }
    let percentage = idle.as_secs_f64() / uptime.as_secs_f64() * 100.0;
    percentage.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_basic() {
        let pct = idle_percentage_for(Duration::from_secs(30), Duration::from_secs(120));
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentage_clamps_high() {
        // Accounting skew can push recorded idle past uptime briefly.
        let pct = idle_percentage_for(Duration::from_secs(130), Duration::from_secs(120));
        assert_eq!(pct, 100.0);
    }

    #[test]
    fn test_percentage_zero_uptime() {
        assert_eq!(idle_percentage_for(Duration::from_secs(5), Duration::ZERO), 0.0);
    }

    #[test]
    fn test_tracker_accumulates() {
        let tracker = IdleTracker::new();
        tracker.record_idle(Duration::from_millis(200));
        tracker.record_idle(Duration::from_millis(300));
        tracker.record_processing(Duration::from_millis(100));

        let (idle, processing, _) = tracker.snapshot();
        assert_eq!(idle, Duration::from_millis(500));
        assert_eq!(processing, Duration::from_millis(100));
    }

    #[test]
    fn test_tracker_percentage_in_range() {
        let tracker = IdleTracker::new();
        tracker.record_idle(Duration::from_secs(3600));
        let pct = tracker.idle_percentage();
        assert!((0.0..=100.0).contains(&pct));
    }
}
