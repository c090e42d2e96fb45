//! CPU-time sampling and cost efficiency.
//!
//! Every 10 seconds the sampler reads cumulative user+kernel CPU time from
//! `/proc/self/stat`, feeds the delta into the CPU-seconds counter, and
//! recomputes the efficiency ratio: cumulative successful operations per
//! cumulative CPU-second. Off Linux (or when the stat file is unreadable)
//! the sampler quietly reports nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics::MetricsCollector;

/// Sampling interval.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Fallback clock ticks per second when `CLK_TCK` is not set.
const DEFAULT_CLK_TCK: u64 = 100;

/// Periodic CPU and efficiency sampler.
pub struct CpuSampler {
    collector: MetricsCollector,
    /// Cumulative successful operations, shared with the job processor.
    operations: Arc<AtomicU64>,
}

impl CpuSampler {
    pub fn new(operations: Arc<AtomicU64>) -> Self {
        Self {
            collector: MetricsCollector::new(),
            operations,
        }
    }

    /// Spawns the sampling task. It ticks every 10 s until shutdown.
    pub fn spawn(self, shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; use it to set the baseline.
            interval.tick().await;
            let mut last_cpu = read_cpu_time().unwrap_or(Duration::ZERO);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = interval.tick() => {
                        let Some(current) = read_cpu_time() else {
                            continue;
                        };
                        let delta = current.saturating_sub(last_cpu);
                        if delta.is_zero() {
                            continue;
                        }
                        self.collector.increment_cpu_seconds(delta.as_secs_f64());
                        last_cpu = current;

                        let ops = self.operations.load(Ordering::Relaxed);
                        let total_cpu = current.as_secs_f64();
                        if ops > 0 && total_cpu > 0.0 {
                            let efficiency = ops as f64 / total_cpu;
                            self.collector.set_cost_efficiency(efficiency);
                            debug!(
                                operations = ops,
                                cpu_seconds = total_cpu,
                                efficiency,
                                "updated cost efficiency"
                            );
                        }
                    }
                }
            }
        })
    }
}

/// Cumulative user+kernel CPU time of this process.
pub fn read_cpu_time() -> Option<Duration> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let ticks = parse_stat_ticks(&stat)?;
    let clk_tck = std::env::var("CLK_TCK")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_CLK_TCK);
    Some(Duration::from_nanos(ticks * 1_000_000_000 / clk_tck))
}

/// Extracts utime + stime (clock ticks) from a `/proc/self/stat` line.
///
/// The comm field may contain spaces, so fields are counted from the last
/// closing parenthesis: after it, utime and stime are the 12th and 13th
/// whitespace-separated fields.
pub fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A realistic stat line: pid 42, comm with a space, state R, then the
    // numeric fields. utime=150, stime=50.
    const STAT_LINE: &str = "42 (my proc) R 1 42 42 0 -1 4194304 500 0 0 0 150 50 0 0 20 0 1 0 100 1000000 200 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";

    #[test]
    fn test_parse_stat_ticks() {
        assert_eq!(parse_stat_ticks(STAT_LINE), Some(200));
    }

    #[test]
    fn test_parse_stat_handles_paren_in_comm() {
        let line = "42 (weird) (name) R 1 42 42 0 -1 4194304 500 0 0 0 30 20 0 0 20 0 1 0 100 1000000 200 1 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        assert_eq!(parse_stat_ticks(line), Some(50));
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat_ticks("").is_none());
        assert!(parse_stat_ticks("no parens here").is_none());
        assert!(parse_stat_ticks("1 (x) R 2 3").is_none());
    }

    #[test]
    fn test_read_cpu_time_on_linux() {
        // On Linux this process must report some CPU time; elsewhere the
        // function degrades to None.
        if std::path::Path::new("/proc/self/stat").exists() {
            assert!(read_cpu_time().is_some());
        }
    }
}
