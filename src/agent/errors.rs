//! Agent errors
//!
//! Every failure leaving the agent is reduced to a stable code and an
//! operator-facing message. Raw detail goes to the process log only.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::engine::EngineError;
use crate::job::JobError;
use crate::services::ServiceError;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("overwrite mode requires a confirmation_token from migration_confirm_overwrite")]
    ConfirmationRequired,

    #[error("socket error at {}: {source}", .path.display())]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AgentError {
    pub(crate) fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn socket(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Socket {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Socket { .. } => "MIGRATE_AGENT_SOCKET",
            AgentError::InvalidRequest(_) => "MIGRATE_AGENT_INVALID_REQUEST",
            AgentError::UnknownAction(_) => "MIGRATE_AGENT_UNKNOWN_ACTION",
            AgentError::InvalidParameter { .. } => "MIGRATE_AGENT_INVALID_PARAMETER",
            AgentError::ConfirmationRequired => "MIGRATE_AGENT_CONFIRMATION_REQUIRED",
            AgentError::Archive(e) => e.code(),
            AgentError::Job(e) => e.code(),
            AgentError::Service(e) => e.code(),
            AgentError::Engine(e) => e.code(),
        }
    }

    /// Message returned to the caller.
    pub fn operator_message(&self) -> String {
        match self {
            AgentError::Archive(e) => e.operator_message(),
            AgentError::Job(e) => e.operator_message(),
            AgentError::Service(e) => e.operator_message(),
            AgentError::Engine(e) => e.operator_message(),
            AgentError::Socket { .. } => "agent socket error".to_string(),
            other => other.to_string(),
        }
    }

    /// Refused before anything started, as opposed to failing midway.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            AgentError::Service(_)
                | AgentError::Socket { .. }
                | AgentError::Engine(EngineError::Rollback { .. })
                | AgentError::Engine(EngineError::Step { .. })
                | AgentError::Engine(EngineError::Service(_))
                | AgentError::Engine(EngineError::Task(_))
        )
    }

    /// `(required, available)` for disk-space rejections.
    pub fn space_figures(&self) -> Option<(u64, u64)> {
        let archive = match self {
            AgentError::Archive(e) => e,
            AgentError::Engine(EngineError::Archive(e)) => e,
            _ => return None,
        };
        match archive {
            ArchiveError::InsufficientSpace {
                required,
                available,
            } => Some((*required, *available)),
            _ => None,
        }
    }
}
