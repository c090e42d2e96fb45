//! Per-job processing state machine.
//!
//! Each popped job runs through: queue-wait measurement → engine connect
//! (breaker + retry) → UCI dialog → result publish (retry). Every path ends
//! with exactly one published result record, success or error. The one
//! exception is a publish that exhausts its retries: that is counted and
//! dropped, and the client times out.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::breaker::BreakerError;
use crate::correlation;
use crate::engine::EngineClient;
use crate::job::{timing, Job, JobResult};
use crate::retry::{with_retry, RetryPolicy};

use super::WorkerContext;

/// Runs one job to completion. Spawned per job by the worker loop.
pub async fn process(ctx: Arc<WorkerContext>, job: Job) {
    let _slot = ctx.active_jobs.acquire();
    let processing_start = Instant::now();

    let correlation_id = if job.correlation_id.is_empty() {
        correlation::generate("worker")
    } else {
        job.correlation_id.clone()
    };

    info!(
        correlation_id = %correlation_id,
        job_id = %job.job_id,
        fen = %job.fen,
        elo = job.elo,
        max_time_ms = job.max_time_ms,
        "processing job"
    );

    let mut result = JobResult::for_job(&job, &correlation_id);

    if let Some(wait) = job.queue_wait() {
        result.record_timing(timing::QUEUE_WAIT_MS, wait);
        ctx.collector.record_queue_wait(wait);
        info!(
            correlation_id = %correlation_id,
            job_id = %job.job_id,
            queue_wait_ms = wait.as_millis() as u64,
            "job dequeued"
        );
    }

    let connect_start = Instant::now();
    let mut client = match connect_engine(&ctx, &correlation_id).await {
        Ok(client) => client,
        Err(message) => {
            result.error = Some(message);
            result.mark_completed();
            publish(&ctx, &result, &correlation_id).await;
            ctx.collector
                .record_total_processing(processing_start.elapsed());
            ctx.idle.record_processing(processing_start.elapsed());
            return;
        }
    };
    let connect_elapsed = connect_start.elapsed();
    result.record_timing(timing::ENGINE_CONNECT_MS, connect_elapsed);
    ctx.collector.record_engine_connect(connect_elapsed);
    info!(
        correlation_id = %correlation_id,
        job_id = %job.job_id,
        connection_ms = connect_elapsed.as_millis() as u64,
        "connected to engine"
    );

    let compute_start = Instant::now();
    match client.analyse(&job.fen, job.elo, job.max_time_ms).await {
        Ok(analysis) => {
            result.bestmove = analysis.bestmove;
            result.ponder = analysis.ponder;
            result.info = analysis.info;
        }
        Err(e) => {
            result.error = Some(format!("engine computation error: {}", e));
        }
    }
    let compute_elapsed = compute_start.elapsed();
    result.record_timing(timing::ENGINE_COMPUTE_MS, compute_elapsed);
    ctx.collector.record_engine_compute(compute_elapsed);

    // Total as known at publish time; the publish span itself is only
    // observable in the metrics, not in the already-sent record.
    result.record_timing(timing::TOTAL_MS, processing_start.elapsed());
    result.mark_completed();

    let publish_start = Instant::now();
    publish(&ctx, &result, &correlation_id).await;
    let publish_elapsed = publish_start.elapsed();
    ctx.collector.record_result_publish(publish_elapsed);

    let total = processing_start.elapsed();
    ctx.collector.record_total_processing(total);
    ctx.idle.record_processing(total);

    if !result.is_error() {
        ctx.successful_ops.fetch_add(1, Ordering::Relaxed);
        ctx.collector.increment_worker_successful_ops();
    }

    info!(
        correlation_id = %correlation_id,
        job_id = %job.job_id,
        queue_wait_ms = result.timings.get(timing::QUEUE_WAIT_MS).copied().unwrap_or(0),
        engine_connect_ms = result.timings.get(timing::ENGINE_CONNECT_MS).copied().unwrap_or(0),
        engine_compute_ms = result.timings.get(timing::ENGINE_COMPUTE_MS).copied().unwrap_or(0),
        result_publish_ms = publish_elapsed.as_millis() as u64,
        total_ms = total.as_millis() as u64,
        bestmove = %result.bestmove,
        error = result.error.as_deref().unwrap_or(""),
        "job completed"
    );
}

/// Dials the engine under the circuit breaker and connect retry policy.
/// Failures come back as the error string to publish in the result.
async fn connect_engine(ctx: &Arc<WorkerContext>, correlation_id: &str) -> Result<EngineClient, String> {
    let addr = ctx.engine_addr.clone();
    let shutdown_rx = ctx.shutdown_tx.subscribe();

    let outcome = ctx
        .engine_breaker
        .call(move || async move {
            with_retry(
                &RetryPolicy::engine_connect(),
                "worker",
                "engine_connect",
                Some(shutdown_rx),
                move || {
                    let addr = addr.clone();
                    async move { EngineClient::connect(&addr).await }
                },
            )
            .await
        })
        .await;

    match outcome {
        Ok(client) => Ok(client),
        Err(BreakerError::Open) => {
            error!(
                correlation_id = %correlation_id,
                circuit_state = "open",
                service = "stockfish",
                "circuit breaker open, failing job immediately"
            );
            Err(
                "engine connect error: engine temporarily unavailable (circuit breaker open, retrying in 30s)"
                    .to_string(),
            )
        }
        Err(BreakerError::ProbeInFlight) => {
            error!(
                correlation_id = %correlation_id,
                circuit_state = "half-open",
                service = "stockfish",
                "circuit breaker half-open, probe already in flight"
            );
            Err("engine connect error: engine temporarily unavailable (circuit breaker half-open)".to_string())
        }
        Err(BreakerError::Inner(e)) => {
            error!(
                correlation_id = %correlation_id,
                error = %e,
                "failed to connect to engine after retries"
            );
            Err(format!("engine connect error: {}", e))
        }
    }
}

/// Publishes the result under the result retry policy. Exhaustion is
/// counted and logged; the job is not retried.
async fn publish(ctx: &Arc<WorkerContext>, result: &JobResult, correlation_id: &str) {
    let queue = ctx.queue.clone();
    let payload = result.clone();
    let shutdown_rx = ctx.shutdown_tx.subscribe();

    let outcome = with_retry(
        &RetryPolicy::result_publish(),
        "worker",
        "result_publish",
        Some(shutdown_rx),
        move || {
            let queue = queue.clone();
            let payload = payload.clone();
            async move { queue.push_result(&payload).await }
        },
    )
    .await;

    match outcome {
        Ok(()) => {
            if result.is_error() {
                warn!(
                    correlation_id = %correlation_id,
                    job_id = %result.job_id,
                    error = result.error.as_deref().unwrap_or(""),
                    "job completed with error"
                );
            } else {
                info!(
                    correlation_id = %correlation_id,
                    job_id = %result.job_id,
                    bestmove = %result.bestmove,
                    "job completed successfully"
                );
            }
        }
        Err(e) => {
            ctx.collector.increment_result_publish_exhausted();
            error!(
                correlation_id = %correlation_id,
                job_id = %result.job_id,
                operation = "result_publish",
                error = %e,
                "failed to publish result after all retries exhausted"
            );
        }
    }
}
