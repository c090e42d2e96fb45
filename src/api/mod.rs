//! Front-end (API) service.
//!
//! Routes:
//!
//! - `POST /move`: accept an analysis request, enqueue a job, await the
//!   matching result
//! - `GET /healthz`: broker liveness and queue depth
//! - `GET /metrics`: Prometheus text exposition
//!
//! Shutdown is graceful: the listener stops accepting, in-flight handlers
//! run to completion, and a 30-second cap forces the exit if they linger.

pub mod handlers;

use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use handlers::ApiState;

use crate::metrics::metrics_handler;

/// Budget for in-flight handlers after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Serves the front-end on the already-bound listener until shutdown.
pub async fn serve(state: ApiState, listener: TcpListener) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/move", any(handlers::handle_move))
        .route("/healthz", get(handlers::handle_healthz))
        .route("/metrics", get(|| async { metrics_handler().await }))
        .with_state(state.clone());

    info!(addr = %listener.local_addr()?, "API listening");

    let mut graceful_rx = state.shutdown_tx.subscribe();
    let mut cap_rx = state.shutdown_tx.subscribe();

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = graceful_rx.recv().await;
    });
    let server = async move { server.await };

    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = cap_rx.recv().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("shutdown grace period expired with requests still in flight");
        }
    }

    Ok(())
}
