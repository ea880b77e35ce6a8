//! CLI argument definitions using clap
//!
//! Commands:
//! - migrad serve --config <path>
//! - migrad request --socket <path>
//! - migrad inspect <backup> --target-user <name>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// migrad - hosting account migration and restore agent
#[derive(Parser, Debug)]
#[command(name = "migrad")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent on its Unix socket until interrupted
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "/etc/migrad/migrad.json")]
        config: PathBuf,
    },

    /// Send one JSON request from stdin to a running agent
    Request {
        /// Agent socket
        #[arg(long, default_value = "/run/migrad/agent.sock")]
        socket: PathBuf,
    },

    /// Analyze a backup offline and print the resulting plan
    Inspect {
        /// Backup archive
        backup: PathBuf,

        /// Account the backup would be restored into
        #[arg(long)]
        target_user: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
