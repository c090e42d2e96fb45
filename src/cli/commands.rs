//! CLI command definitions and service startup.
//!
//! One binary, two long-running subcommands: `api` (the HTTP front-end) and
//! `worker` (the queue-fed engine processor). Flags fall back to the
//! documented environment variables, then to defaults.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::{ApiConfig, WorkerConfig};
use crate::metrics::{self, MetricsCollector};
use crate::queue::JobQueue;
use crate::replicas::ReplicaTracker;
use crate::telemetry::{CpuSampler, QueueDepthSampler};
use crate::worker::{self, Worker, WorkerContext};

/// Distributed chess-analysis dispatch platform.
#[derive(Parser)]
#[command(name = "scalemate")]
#[command(about = "Dispatch chess-position analysis requests to a pool of UCI engines")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the HTTP front-end.
    Api(ApiArgs),

    /// Run the job processor.
    Worker(WorkerArgs),
}

/// Arguments for `scalemate api`.
#[derive(Parser, Debug)]
pub struct ApiArgs {
    /// HTTP listen port.
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Queue endpoint, host:port or a redis:// URL.
    #[arg(long, env = "REDIS_ADDR", default_value = "redis:6379")]
    pub redis_addr: String,

    /// Access-Control-Allow-Origin value for /move responses.
    #[arg(long, env = "CORS_ALLOW_ORIGIN", default_value = "*")]
    pub cors_allow_origin: String,
}

/// Arguments for `scalemate worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Queue endpoint, host:port or a redis:// URL.
    #[arg(long, env = "REDIS_ADDR", default_value = "redis:6379")]
    pub redis_addr: String,

    /// Engine endpoint, host:port.
    #[arg(long, env = "ENGINE_ADDR", default_value = "stockfish:4000")]
    pub engine_addr: String,

    /// Port for /healthz and /metrics.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the selected service.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Api(args) => {
            let config = ApiConfig::default()
                .with_port(args.port)
                .with_redis_addr(args.redis_addr)
                .with_cors_allow_origin(args.cors_allow_origin);
            run_api(config).await
        }
        Commands::Worker(args) => {
            let config = WorkerConfig::default()
                .with_redis_addr(args.redis_addr)
                .with_engine_addr(args.engine_addr)
                .with_metrics_port(args.metrics_port);
            run_worker(config).await
        }
    }
}

async fn run_api(config: ApiConfig) -> anyhow::Result<()> {
    metrics::init_metrics().context("failed to initialize metrics")?;
    info!(service = "api", port = config.port, redis_addr = %config.redis_addr, "service starting");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_signal_listener(shutdown_tx.clone());

    // Bind before anything else: an unusable port is the one unrecoverable
    // startup failure.
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind API port {}", config.port))?;

    let queue = connect_queue(&config.redis_url(), &shutdown_tx).await?;

    let state = ApiState {
        queue: queue.clone(),
        queue_breaker: Arc::new(CircuitBreaker::new("redis", "api", BreakerConfig::queue())),
        collector: MetricsCollector::new(),
        cors_allow_origin: config.cors_allow_origin.clone(),
        shutdown_tx: shutdown_tx.clone(),
    };

    let _sampler = QueueDepthSampler::new(queue).spawn(shutdown_tx.clone());

    api::serve(state, listener).await?;

    info!("api shutdown complete");
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    metrics::init_metrics().context("failed to initialize metrics")?;
    info!(
        service = "worker",
        redis_addr = %config.redis_addr,
        engine_addr = %config.engine_addr,
        metrics_port = config.metrics_port,
        "service starting"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_signal_listener(shutdown_tx.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.metrics_port))
        .await
        .with_context(|| format!("failed to bind metrics port {}", config.metrics_port))?;

    let queue = connect_queue(&config.redis_url(), &shutdown_tx).await?;
    let ctx = Arc::new(WorkerContext::new(&config, queue, shutdown_tx.clone()));

    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = worker::http::serve(ctx, listener).await {
                error!(error = %e, "observability server failed");
            }
        });
    }

    let _cpu = CpuSampler::new(Arc::clone(&ctx.successful_ops)).spawn(shutdown_tx.clone());
    let _idle = Arc::clone(&ctx.idle).spawn_sampler(shutdown_tx.clone());
    if let Some(tracker) = ReplicaTracker::from_cluster() {
        let _replicas = tracker.spawn(shutdown_tx.clone());
    }

    Worker::new(config, Arc::clone(&ctx)).run().await;

    info!("worker shutdown complete");
    Ok(())
}

/// Connects to the queue, retrying every two seconds until it answers or
/// shutdown is requested. The queue being down must not crash-loop the
/// service; the breakers take over once it is reachable.
async fn connect_queue(
    redis_url: &str,
    shutdown_tx: &broadcast::Sender<()>,
) -> anyhow::Result<JobQueue> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        match JobQueue::connect(redis_url).await {
            Ok(queue) => {
                info!(redis_url, "connected to redis");
                return Ok(queue);
            }
            Err(e) => {
                error!(redis_url, error = %e, "redis connection failed, retrying in 2s");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
            _ = shutdown_rx.recv() => anyhow::bail!("shutdown requested during startup"),
        }
    }
}

/// Closes the process-wide stop channel on SIGTERM or SIGINT.
fn spawn_signal_listener(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_api_subcommand() {
        let cli = Cli::try_parse_from([
            "scalemate",
            "api",
            "--port",
            "8081",
            "--redis-addr",
            "localhost:6379",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Api(args) => {
                assert_eq!(args.port, 8081);
                assert_eq!(args.redis_addr, "localhost:6379");
                assert_eq!(args.cors_allow_origin, "*");
            }
            _ => panic!("expected api subcommand"),
        }
    }

    #[test]
    fn test_cli_parses_worker_subcommand() {
        let cli = Cli::try_parse_from(["scalemate", "worker", "--engine-addr", "localhost:4000"])
            .expect("should parse");

        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.engine_addr, "localhost:4000");
                assert_eq!(args.metrics_port, 9090);
            }
            _ => panic!("expected worker subcommand"),
        }
    }

    #[test]
    fn test_cli_global_log_level() {
        let cli = Cli::try_parse_from(["scalemate", "worker", "--log-level", "debug"])
            .expect("should parse");
        assert_eq!(cli.log_level, "debug");
    }
}
