//! Front-end HTTP handlers.
//!
//! `/move` dispatches on method itself so that preflight gets its 204 and
//! every response, errors included, carries the CORS headers and the
//! correlation ID. Responses are built by `finish`, which also records the
//! status-labelled latency and the request counter on every exit path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::correlation::{self, CORRELATION_HEADER};
use crate::job::{now_rfc3339_nanos, Job, MoveRequest, MoveResponse};
use crate::metrics::MetricsCollector;
use crate::queue::JobQueue;
use crate::retry::{with_retry, RetryPolicy};

/// Service label used in correlation IDs, logs, and retry metrics.
pub const SERVICE: &str = "api";

/// Sleep between result-list scans.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace added to the think time for the overall request deadline.
const RESULT_GRACE: Duration = Duration::from_secs(5);

/// Budget for the broker liveness probe in `/healthz`.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Request bodies are tiny (a FEN plus two integers).
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state for the front-end handlers.
#[derive(Clone)]
pub struct ApiState {
    pub queue: JobQueue,
    pub queue_breaker: Arc<CircuitBreaker>,
    pub collector: MetricsCollector,
    pub cors_allow_origin: String,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// `/move` entry point for every method.
pub async fn handle_move(State(state): State<ApiState>, req: Request) -> Response {
    let started = Instant::now();
    let inbound = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let correlation_id = correlation::or_generate(inbound.as_deref(), SERVICE);

    if req.method() == Method::OPTIONS {
        return finish(&state, &correlation_id, started, StatusCode::NO_CONTENT, None);
    }
    if req.method() != Method::POST {
        warn!(
            correlation_id = %correlation_id,
            method = %req.method(),
            "method not allowed on /move"
        );
        return finish(
            &state,
            &correlation_id,
            started,
            StatusCode::METHOD_NOT_ALLOWED,
            Some(error_body(&correlation_id, "POST only")),
        );
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "failed to read request body");
            return finish(
                &state,
                &correlation_id,
                started,
                StatusCode::BAD_REQUEST,
                Some(error_body(&correlation_id, "failed to read request body")),
            );
        }
    };

    let mut request: MoveRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "rejected malformed request body");
            return finish(
                &state,
                &correlation_id,
                started,
                StatusCode::BAD_REQUEST,
                Some(error_body(&correlation_id, &format!("bad json: {}", e))),
            );
        }
    };

    if let Err(reason) = request.validate() {
        warn!(correlation_id = %correlation_id, reason, "rejected invalid request");
        return finish(
            &state,
            &correlation_id,
            started,
            StatusCode::BAD_REQUEST,
            Some(error_body(&correlation_id, reason)),
        );
    }
    request.normalize();

    let job = Job::new(&request.fen, request.elo, request.movetime_ms, &correlation_id);
    info!(
        correlation_id = %correlation_id,
        job_id = %job.job_id,
        elo = job.elo,
        movetime_ms = job.max_time_ms,
        fen = %job.fen,
        "request started"
    );

    if let Err(e) = publish_job(&state, &job).await {
        return match e {
            BreakerError::Open | BreakerError::ProbeInFlight => {
                let breaker_state = state.queue_breaker.state();
                error!(
                    correlation_id = %correlation_id,
                    circuit_state = %breaker_state,
                    "queue circuit breaker rejected publish"
                );
                warn!(
                    correlation_id = %correlation_id,
                    job_id = %job.job_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "request completed with error"
                );
                let body = service_unavailable_body(
                    &correlation_id,
                    &breaker_state.to_string(),
                    state.queue_breaker.failure_count(),
                );
                finish_with_retry_after(&state, &correlation_id, started, body)
            }
            BreakerError::Inner(err) => {
                error!(correlation_id = %correlation_id, error = %err, "failed to queue job");
                warn!(
                    correlation_id = %correlation_id,
                    job_id = %job.job_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "request completed with error"
                );
                finish(
                    &state,
                    &correlation_id,
                    started,
                    StatusCode::SERVICE_UNAVAILABLE,
                    Some(error_body(
                        &correlation_id,
                        &format!("failed to queue job: {}", err),
                    )),
                )
            }
        };
    }

    let deadline = Duration::from_millis(job.max_time_ms.max(0) as u64) + RESULT_GRACE;
    let result = wait_for_result(&state, &job.job_id, &correlation_id, deadline).await;

    let Some(result) = result else {
        warn!(
            correlation_id = %correlation_id,
            job_id = %job.job_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "request completed with error"
        );
        return finish(
            &state,
            &correlation_id,
            started,
            StatusCode::REQUEST_TIMEOUT,
            Some(error_body(
                &correlation_id,
                "job timeout or error: timeout waiting for job result",
            )),
        );
    };

    if result.is_error() {
        let engine_error = result.error.unwrap_or_default();
        warn!(
            correlation_id = %correlation_id,
            job_id = %job.job_id,
            error = %engine_error,
            duration_ms = started.elapsed().as_millis() as u64,
            "request completed with error"
        );
        return finish(
            &state,
            &correlation_id,
            started,
            StatusCode::REQUEST_TIMEOUT,
            Some(error_body(
                &correlation_id,
                &format!("job timeout or error: engine error: {}", engine_error),
            )),
        );
    }

    state.collector.increment_api_successful_ops();
    info!(
        correlation_id = %correlation_id,
        job_id = %job.job_id,
        bestmove = %result.bestmove,
        duration_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );

    let response = MoveResponse {
        bestmove: result.bestmove,
        ponder: result.ponder,
        info: result.info,
    };
    match serde_json::to_value(&response) {
        Ok(payload) => finish(&state, &correlation_id, started, StatusCode::OK, Some(payload)),
        Err(e) => {
            error!(correlation_id = %correlation_id, error = %e, "response serialisation failed");
            finish(
                &state,
                &correlation_id,
                started,
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(error_body(&correlation_id, "failed to serialize response")),
            )
        }
    }
}

/// `/healthz`: broker liveness within 2 s plus the current queue depth.
pub async fn handle_healthz(State(state): State<ApiState>) -> Response {
    let redis_ok = state.queue.ping(HEALTH_PROBE_TIMEOUT).await.is_ok();
    let depth = if redis_ok {
        state.queue.depth().await.unwrap_or(0)
    } else {
        0
    };

    let status_code = if redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if redis_ok { "healthy" } else { "unhealthy" },
        "redis_connected": redis_ok,
        "queue_depth": depth,
        "timestamp": now_rfc3339_nanos(),
    });

    (status_code, Json(body)).into_response()
}

/// Publishes the job through the queue breaker with the job-publish retry
/// policy.
async fn publish_job(
    state: &ApiState,
    job: &Job,
) -> Result<(), BreakerError<crate::retry::RetryError<crate::queue::QueueError>>> {
    let queue = state.queue.clone();
    let record = job.clone();
    let shutdown_rx = state.shutdown_tx.subscribe();

    state
        .queue_breaker
        .call(move || async move {
            with_retry(
                &RetryPolicy::job_publish(),
                SERVICE,
                "job_publish",
                Some(shutdown_rx),
                move || {
                    let queue = queue.clone();
                    let record = record.clone();
                    async move { queue.push_job(&record).await }
                },
            )
            .await
        })
        .await
        .map(|_| ())
}

/// Polls the results list until the matching record is claimed or the
/// deadline passes. Scan errors are tolerated; the next poll retries.
async fn wait_for_result(
    state: &ApiState,
    job_id: &str,
    correlation_id: &str,
    deadline: Duration,
) -> Option<crate::job::JobResult> {
    let wait_started = Instant::now();
    loop {
        if wait_started.elapsed() >= deadline {
            return None;
        }
        match state.queue.claim_result(job_id).await {
            Ok(Some(result)) => return Some(result),
            Ok(None) => {}
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "result scan failed");
            }
        }
        tokio::time::sleep(RESULT_POLL_INTERVAL).await;
    }
}

/// Plain error body carrying the correlation ID.
fn error_body(correlation_id: &str, message: &str) -> Value {
    json!({
        "error": message,
        "correlation_id": correlation_id,
    })
}

/// The 503 envelope returned while the queue breaker rejects publishes.
fn service_unavailable_body(correlation_id: &str, breaker_state: &str, failure_count: u32) -> Value {
    json!({
        "error": {
            "code": "SERVICE_UNAVAILABLE",
            "retry_after_seconds": 30,
            "details": {
                "circuit_breaker_state": breaker_state,
                "failure_count": failure_count,
            }
        },
        "correlation_id": correlation_id,
    })
}

/// Builds the response, stamping CORS and correlation headers, and records
/// the exit-path metrics.
fn finish(
    state: &ApiState,
    correlation_id: &str,
    started: Instant,
    status: StatusCode,
    body: Option<Value>,
) -> Response {
    let response = build_response(state, correlation_id, status, body);
    state
        .collector
        .record_request_duration("/move", status.as_str(), started.elapsed());
    state.collector.increment_request_counter(status.as_str());
    response
}

/// `finish` plus the `Retry-After: 30` header for breaker rejections.
fn finish_with_retry_after(
    state: &ApiState,
    correlation_id: &str,
    started: Instant,
    body: Value,
) -> Response {
    let mut response = finish(
        state,
        correlation_id,
        started,
        StatusCode::SERVICE_UNAVAILABLE,
        Some(body),
    );
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
    response
}

fn build_response(
    state: &ApiState,
    correlation_id: &str,
    status: StatusCode,
    body: Option<Value>,
) -> Response {
    let payload = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };

    let mut response = Response::new(payload);
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(CORRELATION_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.cors_allow_origin) {
        headers.insert("access-control-allow-origin", value);
    }
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("POST, OPTIONS"),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_carries_correlation() {
        let body = error_body("trace-xyz", "missing fen");
        assert_eq!(body["error"], "missing fen");
        assert_eq!(body["correlation_id"], "trace-xyz");
    }

    #[test]
    fn test_service_unavailable_envelope() {
        let body = service_unavailable_body("api-1-abc", "open", 3);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(body["error"]["retry_after_seconds"], 30);
        assert_eq!(body["error"]["details"]["circuit_breaker_state"], "open");
        assert_eq!(body["error"]["details"]["failure_count"], 3);
        assert_eq!(body["correlation_id"], "api-1-abc");
    }

    #[test]
    fn test_deadline_formula() {
        // movetime + 5000 ms, the contract clients time their calls around.
        let movetime: i64 = 1000;
        let deadline = Duration::from_millis(movetime.max(0) as u64) + RESULT_GRACE;
        assert_eq!(deadline, Duration::from_millis(6000));
    }
}
