//! scalemate: distributed chess-analysis dispatch platform.
//!
//! An HTTP front-end accepts position-analysis requests, pushes them as
//! jobs onto a shared Redis queue, and awaits matching results; workers
//! blocking-pop jobs, drive the UCI dialog against an engine over TCP, and
//! publish results back. Circuit breakers, jittered retries, correlation
//! IDs, and a Prometheus observation plane are shared by both sides.

// Core modules
pub mod api;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod replicas;
pub mod retry;
pub mod telemetry;
pub mod worker;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use engine::{Analysis, EngineClient, EngineError};
pub use job::{Job, JobResult, MoveRequest, MoveResponse};
pub use queue::{JobQueue, QueueError};
pub use retry::{with_retry, RetryError, RetryPolicy};
