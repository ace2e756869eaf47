//! Command-line interface for ingest-forge.
//!
//! Provides commands to run the ingestion service, inspect the task store,
//! and run a single scan pass.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
