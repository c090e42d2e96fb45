//! Command-line interface for scalemate.
//!
//! Provides the `api` and `worker` subcommands plus their startup wiring.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
