//! CLI module for migrad
//!
//! Provides command-line interface for:
//! - serve: run the agent until interrupted
//! - request: one-shot request against a running agent
//! - inspect: offline analysis of a backup

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{inspect, request, run, run_command, serve};
pub use errors::{CliError, CliResult};
pub use io::{read_request, write_json, write_line};
