//! Job manager errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use super::state::MigrationStatus;

/// Result type for job operations
pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("migration job {0} not found")]
    NotFound(Uuid),

    #[error("job {job_id} is {current}, cannot {action}")]
    InvalidState {
        job_id: Uuid,
        current: MigrationStatus,
        action: String,
    },

    #[error("job {0} already has a plan attached")]
    PlanAlreadyAttached(Uuid),

    #[error("job {0} has no plan attached")]
    PlanMissing(Uuid),

    #[error("approval token rejected: {0}")]
    TokenRejected(String),

    #[error("job store error at {}: {source}", .path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt job record {}: {detail}", .path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("job table lock poisoned")]
    LockPoisoned,
}

impl JobError {
    pub(crate) fn store(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Store {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_state(job_id: Uuid, current: MigrationStatus, action: &str) -> Self {
        Self::InvalidState {
            job_id,
            current,
            action: action.to_string(),
        }
    }

    /// Message without store paths or parse detail.
    pub fn operator_message(&self) -> String {
        match self {
            JobError::Store { .. } | JobError::Corrupt { .. } => "job store unavailable".to_string(),
            JobError::LockPoisoned => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "MIGRATE_JOB_NOT_FOUND",
            JobError::InvalidState { .. } => "MIGRATE_JOB_INVALID_STATE",
            JobError::PlanAlreadyAttached(_) => "MIGRATE_JOB_PLAN_ATTACHED",
            JobError::PlanMissing(_) => "MIGRATE_JOB_PLAN_MISSING",
            JobError::TokenRejected(_) => "MIGRATE_JOB_TOKEN_REJECTED",
            JobError::Store { .. } => "MIGRATE_JOB_STORE",
            JobError::Corrupt { .. } => "MIGRATE_JOB_CORRUPT",
            JobError::LockPoisoned => "MIGRATE_JOB_LOCK_POISONED",
        }
    }
}
