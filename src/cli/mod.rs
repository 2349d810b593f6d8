//! Command-line interface for onto-forge.
//!
//! Provides commands for running, resuming and inspecting pipelines.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
