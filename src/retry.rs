//! Retry with jittered exponential backoff.
//!
//! Three policies cover the pipeline's transient-failure points:
//!
//! - engine connect (worker → engine TCP dial)
//! - result publish (worker → queue)
//! - job publish (front-end → queue, fixed short delay)
//!
//! For attempt *n* (0-indexed) the base delay is
//! `min(initial * multiplier^n, max_delay)`; jitter then scales it by a
//! uniform factor in `[1 - jitter, 1 + jitter]`. Every non-first attempt
//! increments the retry counter labeled (service, operation, attempt).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::metrics::MetricsCollector;

/// Error returned when a retried operation ultimately fails.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed; wraps the last error.
    #[error("all retry attempts exhausted: {0}")]
    Exhausted(#[source] E),

    /// The backoff wait was interrupted by process shutdown.
    #[error("retry aborted by shutdown")]
    Aborted,
}

/// Backoff configuration for one class of operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter fraction in [0, 1]; 0.2 means plus or minus 20%.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy for worker → engine TCP dials: 3 attempts, 100 ms initial,
    /// doubling to a 5 s cap, 20% jitter.
    pub fn engine_connect() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Policy for worker → queue result publishing: same shape as engine
    /// connect.
    pub fn result_publish() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Policy for front-end → queue job publishing: 2 attempts, fixed 50 ms,
    /// no jitter. The client is waiting, so the retry budget is tiny.
    pub fn job_publish() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Base delay for a 0-indexed attempt: `min(initial * mult^n, cap)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay for a 0-indexed attempt.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor: f64 = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let delayed = base * (1.0 + factor);
        if delayed <= 0.0 {
            self.initial_delay
        } else {
            Duration::from_secs_f64(delayed)
        }
    }
}

/// Runs `op` under the given retry policy.
///
/// `service` and `operation` label the retry counter and log records. When
/// `shutdown` is supplied, a shutdown broadcast aborts the backoff wait and
/// the call returns `RetryError::Aborted`.
///
/// # Errors
///
/// Returns `RetryError::Exhausted` wrapping the last failure once all
/// attempts are spent.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    service: &str,
    operation: &str,
    mut shutdown: Option<broadcast::Receiver<()>>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let collector = MetricsCollector::new();
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            collector.increment_retry_attempts(service, operation, attempt + 1);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    service,
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "attempt failed"
                );
                last_err = Some(e);
            }
        }

        // No sleep after the final attempt.
        if attempt + 1 == policy.max_attempts {
            break;
        }

        let delay = policy.jittered_delay(attempt);
        warn!(
            service,
            operation,
            backoff_ms = delay.as_millis() as u64,
            "retrying after backoff"
        );

        match shutdown.as_mut() {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = rx.recv() => return Err(RetryError::Aborted),
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }

    match last_err {
        Some(e) => Err(RetryError::Exhausted(e)),
        // max_attempts is never zero for the policies above; treat a
        // misconfigured zero-attempt policy as an immediate abort.
        None => Err(RetryError::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_policy_constants() {
        let s = RetryPolicy::engine_connect();
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.initial_delay, Duration::from_millis(100));
        assert_eq!(s.max_delay, Duration::from_secs(5));

        let q = RetryPolicy::job_publish();
        assert_eq!(q.max_attempts, 2);
        assert_eq!(q.initial_delay, Duration::from_millis(50));
        assert_eq!(q.max_delay, Duration::from_millis(50));
        assert_eq!(q.jitter, 0.0);
    }

    #[test]
    fn test_base_delay_growth_and_cap() {
        let policy = RetryPolicy::engine_connect();
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        // 100ms * 2^10 would be far past the cap.
        assert_eq!(policy.base_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::engine_connect();
        for attempt in 0..4 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..100 {
                let jittered = policy.jittered_delay(attempt).as_secs_f64();
                assert!(
                    jittered >= base * (1.0 - policy.jitter) - 1e-9,
                    "jittered {} below lower bound for base {}",
                    jittered,
                    base
                );
                assert!(
                    jittered <= base * (1.0 + policy.jitter) + 1e-9,
                    "jittered {} above upper bound for base {}",
                    jittered,
                    base
                );
            }
        }
    }

    #[test]
    fn test_no_jitter_is_deterministic() {
        let policy = RetryPolicy::job_publish();
        assert_eq!(policy.jittered_delay(0), Duration::from_millis(50));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_succeeds_on_later_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = with_retry(&policy, "test", "op", None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Boom)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt should succeed"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: 0.0,
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&policy, "test", "op", None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Boom) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let err = result.expect_err("should exhaust");
        assert!(err.to_string().contains("retry attempts exhausted"));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
            jitter: 0.0,
        };
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            with_retry::<(), _, _, _>(&policy, "test", "op", Some(rx), || async {
                Err::<(), _>(Boom)
            })
            .await
        });

        // Give the first attempt time to fail and enter the backoff wait.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(());

        let result = handle.await.expect("task should not panic");
        assert!(matches!(result, Err(RetryError::Aborted)));
    }
}
