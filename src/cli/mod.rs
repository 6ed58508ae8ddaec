//! Command-line interface for queue-dispatch.
//!
//! Provides commands for schema setup, enqueueing, dispatching, running a
//! worker and inspecting the queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
