//! CLI-specific error types
//!
//! Every CLI error is fatal: main prints it and exits non-zero.

use std::io;

use thiserror::Error;

use crate::agent::AgentError;
use crate::config::ConfigError;
use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty input")]
    EmptyInput,

    #[error("cannot start runtime: {0}")]
    Runtime(String),
}

impl CliError {
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(e) => e.code(),
            CliError::Agent(e) => e.code(),
            CliError::Engine(e) => e.code(),
            CliError::Io(_) => "MIGRATE_CLI_IO",
            CliError::Json(_) => "MIGRATE_CLI_JSON",
            CliError::EmptyInput => "MIGRATE_CLI_EMPTY_INPUT",
            CliError::Runtime(_) => "MIGRATE_CLI_RUNTIME",
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
