//! Circuit breakers for the engine and queue dependencies.
//!
//! A breaker is a three-phase controller guarding one dependency from one
//! component:
//!
//! - **Closed**: calls pass through; consecutive failures inside the
//!   counting window are tallied, and reaching the threshold opens the
//!   circuit.
//! - **Open**: calls are rejected with `BreakerError::Open` without touching
//!   the dependency. After the open timeout the next call is admitted as a
//!   half-open probe.
//! - **HalfOpen**: one probe is in flight; success closes the circuit,
//!   failure re-opens it and restarts the timer.
//!
//! Every transition updates the `circuit_breaker_state` gauge
//! (closed=0, half-open=1, open=2) and the edge into open increments the
//! failure counter, both labeled (service, component).

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::MetricsCollector;

/// Breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    /// Gauge encoding: closed=0, half-open=1, open=2.
    pub fn as_gauge(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::HalfOpen => write!(f, "half-open"),
            BreakerState::Open => write!(f, "open"),
        }
    }
}

/// Error returned by a guarded call.
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error + 'static,
{
    /// The circuit is open; the dependency was not contacted.
    #[error("circuit breaker is open")]
    Open,

    /// The circuit is half-open and its probe budget is already in use.
    #[error("circuit breaker half-open probe already in flight")]
    ProbeInFlight,

    /// The call went through and failed; wraps the underlying error.
    #[error(transparent)]
    Inner(E),
}

/// Breaker thresholds for one dependency.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Window within which consecutive failures are counted; a failure
    /// landing after the window expires restarts the tally.
    pub failure_window: Duration,
    /// Time the circuit stays open before admitting a probe.
    pub open_timeout: Duration,
    /// Probes allowed concurrently while half-open.
    pub half_open_probes: u32,
}

impl BreakerConfig {
    /// Worker → engine breaker: 5 failures in 60 s, 30 s open, 1 probe.
    pub fn engine() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }

    /// Front-end → queue breaker: 3 failures in 30 s, 30 s open, 1 probe.
    pub fn queue() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// A circuit breaker guarding one (service, component) dependency.
pub struct CircuitBreaker {
    service: String,
    component: String,
    config: BreakerConfig,
    collector: MetricsCollector,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a breaker in the closed state and publishes its gauge.
    pub fn new(service: &str, component: &str, config: BreakerConfig) -> Self {
        let collector = MetricsCollector::new();
        collector.set_circuit_breaker_state(service, component, BreakerState::Closed.as_gauge());
        Self {
            service: service.to_string(),
            component: component.to_string(),
            config,
            collector,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start: None,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    /// Executes `op` under breaker protection.
    ///
    /// While open, returns `BreakerError::Open` without awaiting `op`. A
    /// half-open circuit admits one probe; concurrent callers get
    /// `BreakerError::ProbeInFlight`. Admission and outcome recording are
    /// each atomic with respect to state transitions.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Current state, accounting for open-timeout expiry.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Open
                if inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.open_timeout) =>
            {
                // The next admitted call will perform the half-open
                // transition; report what that caller will see.
                BreakerState::HalfOpen
            }
            state => state,
        }
    }

    /// Consecutive failure count inside the current window.
    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>>
    where
        E: std::error::Error + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.open_timeout);
                if !expired {
                    return Err(BreakerError::Open);
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.probes_in_flight = 1;
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_probes {
                    return Err(BreakerError::ProbeInFlight);
                }
                inner.probes_in_flight += 1;
                Ok(())
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probes_in_flight = 0;
                inner.consecutive_failures = 0;
                inner.window_start = None;
                self.transition(&mut inner, BreakerState::Closed);
            }
            _ => {
                inner.consecutive_failures = 0;
                inner.window_start = None;
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probes_in_flight = 0;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {
                let window_expired = inner
                    .window_start
                    .is_some_and(|t| t.elapsed() >= self.config.failure_window);
                if inner.window_start.is_none() || window_expired {
                    inner.window_start = Some(Instant::now());
                    inner.consecutive_failures = 1;
                } else {
                    inner.consecutive_failures += 1;
                }
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            // A late completion from before the trip; the timer governs now.
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.collector
            .set_circuit_breaker_state(&self.service, &self.component, to.as_gauge());
        if to == BreakerState::Open {
            self.collector
                .increment_circuit_breaker_failures(&self.service, &self.component);
            warn!(
                service = %self.service,
                component = %self.component,
                from = %from,
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        } else {
            info!(
                service = %self.service,
                component = %self.component,
                from = %from,
                to = %to,
                "circuit breaker state changed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("dial refused")]
    struct Refused;

    fn fast_config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_millis(50),
            half_open_probes: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>(Refused) }).await;
    }

    #[test]
    fn test_state_gauge_encoding() {
        assert_eq!(BreakerState::Closed.as_gauge(), 0.0);
        assert_eq!(BreakerState::HalfOpen.as_gauge(), 1.0);
        assert_eq!(BreakerState::Open.as_gauge(), 2.0);
    }

    #[test]
    fn test_default_configs() {
        let engine = BreakerConfig::engine();
        assert_eq!(engine.failure_threshold, 5);
        assert_eq!(engine.failure_window, Duration::from_secs(60));
        assert_eq!(engine.open_timeout, Duration::from_secs(30));

        let queue = BreakerConfig::queue();
        assert_eq!(queue.failure_threshold, 3);
        assert_eq!(queue.failure_window, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("stockfish", "worker", fast_config(3));
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling() {
        let breaker = CircuitBreaker::new("stockfish", "worker", fast_config(1));
        fail(&breaker).await;

        let calls = AtomicU32::new(0);
        let result = breaker
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Refused>(()) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "dependency must not be touched");
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("stockfish", "worker", fast_config(1));
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let result = breaker.call(|| async { Ok::<_, Refused>(42) }).await;
        assert_eq!(result.expect("probe should pass through"), 42);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("stockfish", "worker", fast_config(1));
        fail(&breaker).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Timer restarted: still rejecting right after the failed probe.
        let result = breaker.call(|| async { Ok::<_, Refused>(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_success_resets_failure_tally() {
        let breaker = CircuitBreaker::new("redis", "api", fast_config(3));
        fail(&breaker).await;
        fail(&breaker).await;
        let _ = breaker.call(|| async { Ok::<_, Refused>(()) }).await;
        fail(&breaker).await;
        fail(&breaker).await;

        // Two failures after a reset never reach the threshold of three.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_failure_window_restart() {
        let breaker = CircuitBreaker::new(
            "redis",
            "api",
            BreakerConfig {
                failure_threshold: 2,
                failure_window: Duration::from_millis(30),
                open_timeout: Duration::from_secs(30),
                half_open_probes: 1,
            },
        );

        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        fail(&breaker).await;

        // The second failure fell outside the window and restarted the tally.
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }
}
