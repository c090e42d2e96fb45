//! Worker observability endpoints: `/healthz` and `/metrics`.
//!
//! Health reports Redis connectivity (2 s ping), engine responsiveness (a
//! live `uci` probe capped at 2 s), and the current in-flight job count.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::engine;
use crate::job::now_rfc3339_nanos;
use crate::metrics::metrics_handler;

use super::WorkerContext;

/// Budget for each dependency probe in the health check.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    redis_connected: bool,
    stockfish_healthy: bool,
    current_jobs: i64,
    timestamp: String,
}

async fn handle_healthz(State(ctx): State<Arc<WorkerContext>>) -> Response {
    let redis_ok = ctx.queue.ping(PROBE_TIMEOUT).await.is_ok();
    let engine_ok = engine::probe(&ctx.engine_addr, PROBE_TIMEOUT).await;

    let healthy = redis_ok && engine_ok;
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let health = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" },
        redis_connected: redis_ok,
        stockfish_healthy: engine_ok,
        current_jobs: ctx.active_jobs.count(),
        timestamp: now_rfc3339_nanos(),
    };

    (status_code, Json(health)).into_response()
}

/// Serves `/healthz` and `/metrics` on the already-bound listener until the
/// shutdown broadcast fires.
pub async fn serve(ctx: Arc<WorkerContext>, listener: TcpListener) -> anyhow::Result<()> {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();

    let app = Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/metrics", get(|| async { metrics_handler().await }))
        .with_state(ctx);

    info!(addr = %listener.local_addr()?, "observability server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    Ok(())
}
