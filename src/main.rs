//! Binary entry point: set up JSON logging, then hand off to the selected
//! subcommand (`api` or `worker`).

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(cli_level: &str) {
    // RUST_LOG wins over the --log-level flag when both are present.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli_level));

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = scalemate::cli::parse_cli();
    init_logging(&cli.log_level);
    scalemate::cli::run_with_cli(cli).await
}
