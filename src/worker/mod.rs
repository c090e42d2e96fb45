//! Job processor (worker) service.
//!
//! The worker blocking-pops jobs from the shared queue and spawns one task
//! per job, so a slow engine dialog never stalls the pop loop. Shared state
//! lives in `WorkerContext`; the active-job count is held through a guard
//! that decrements on drop, so every exit path (success, error, panic)
//! releases its slot.
//!
//! Shutdown: on the broadcast signal the loop stops popping, records the
//! final idle span, then waits for the active-job count to reach zero,
//! polling every 100 ms up to the configured budget (30 s).

pub mod http;
pub mod processor;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::WorkerConfig;
use crate::metrics::MetricsCollector;
use crate::queue::JobQueue;
use crate::telemetry::IdleTracker;

/// Poll interval while draining active jobs at shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// In-flight job counter backing the `worker_active_jobs` gauge.
#[derive(Clone, Default)]
pub struct ActiveJobs {
    count: Arc<AtomicI64>,
    collector: MetricsCollector,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of in-flight jobs.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Takes one slot, returning a guard that releases it on drop.
    pub fn acquire(&self) -> ActiveJobGuard {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.collector.set_active_jobs(count as f64);
        ActiveJobGuard { jobs: self.clone() }
    }
}

/// Scoped hold on one active-job slot. Dropping the guard releases the slot
/// and refreshes the gauge, which covers panicking job tasks as well.
pub struct ActiveJobGuard {
    jobs: ActiveJobs,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        let count = self.jobs.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.jobs.collector.set_active_jobs(count as f64);
    }
}

/// State shared between the pop loop, job tasks, samplers, and the
/// observability endpoints.
pub struct WorkerContext {
    pub queue: JobQueue,
    pub engine_addr: String,
    pub engine_breaker: CircuitBreaker,
    pub collector: MetricsCollector,
    pub idle: Arc<IdleTracker>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub active_jobs: ActiveJobs,
    /// Jobs completed without error, read by the CPU/efficiency sampler.
    pub successful_ops: Arc<AtomicU64>,
}

impl WorkerContext {
    pub fn new(config: &WorkerConfig, queue: JobQueue, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            queue,
            engine_addr: config.engine_addr.clone(),
            engine_breaker: CircuitBreaker::new("stockfish", "worker", BreakerConfig::engine()),
            collector: MetricsCollector::new(),
            idle: Arc::new(IdleTracker::new()),
            shutdown_tx,
            active_jobs: ActiveJobs::new(),
            successful_ops: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// The worker's main loop.
pub struct Worker {
    config: WorkerConfig,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(config: WorkerConfig, ctx: Arc<WorkerContext>) -> Self {
        Self { config, ctx }
    }

    /// Pops and dispatches jobs until shutdown, then drains.
    pub async fn run(self) {
        let mut shutdown_rx = self.ctx.shutdown_tx.subscribe();
        let mut idle_start = Instant::now();

        info!(engine_addr = %self.ctx.engine_addr, "worker loop started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!("stopping job processing loop");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.ctx.queue.pop_job(self.config.pop_timeout).await {
                Ok(Some(job)) => {
                    let idle_span = idle_start.elapsed();
                    self.ctx.idle.record_idle(idle_span);
                    self.ctx.collector.increment_idle_time(idle_span);

                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        processor::process(ctx, job).await;
                    });

                    idle_start = Instant::now();
                }
                Ok(None) => {
                    // Timed out empty; the wait keeps accumulating as idle
                    // until a job arrives or shutdown fires.
                }
                Err(e) => {
                    error!(error = %e, "queue pop failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // The tail of the last wait counts as idle too.
        let final_idle = idle_start.elapsed();
        self.ctx.idle.record_idle(final_idle);
        self.ctx.collector.increment_idle_time(final_idle);

        self.drain().await;
    }

    /// Waits for in-flight jobs to finish, bounded by the shutdown budget.
    async fn drain(&self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let active = self.ctx.active_jobs.count();
            if active == 0 {
                info!("all jobs completed, shutting down");
                return;
            }
            if Instant::now() >= deadline {
                warn!(active, "shutdown timeout reached, forcing exit");
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_jobs_guard_balances() {
        let jobs = ActiveJobs::new();
        assert_eq!(jobs.count(), 0);

        {
            let _a = jobs.acquire();
            let _b = jobs.acquire();
            assert_eq!(jobs.count(), 2);
        }

        assert_eq!(jobs.count(), 0);
    }

    #[test]
    fn test_active_jobs_guard_released_on_panic() {
        let jobs = ActiveJobs::new();

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = jobs.acquire();
            panic!("job blew up");
        }));

        assert!(caught.is_err());
        assert_eq!(jobs.count(), 0);
    }

    #[test]
    fn test_guard_survives_nested_moves() {
        let jobs = ActiveJobs::new();
        let guard = jobs.acquire();
        let moved = guard;
        assert_eq!(jobs.count(), 1);
        drop(moved);
        assert_eq!(jobs.count(), 0);
    }
}
