//! Engine errors
//!
//! Apply errors carry the failing step; rollback errors aggregate every
//! component that could not be reversed.

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::job::JobError;
use crate::services::ServiceError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("stored plan is unreadable: {0}")]
    PlanUnreadable(String),

    #[error("target user {0} already exists and overwrite was not authorized")]
    TargetUserExists(String),

    #[error("{count} unresolved conflicts block apply: {}", .subjects.join(", "))]
    Blocked { count: usize, subjects: Vec<String> },

    #[error("{0}")]
    Verification(String),

    #[error("step '{step}' failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<EngineError>,
    },

    #[error("rollback incomplete, could not reverse: {}", .components.join("; "))]
    Rollback { components: Vec<String> },

    #[error("apply pool is shut down")]
    PoolClosed,

    #[error("background task failed: {0}")]
    Task(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Archive(e) => e.code(),
            EngineError::Job(e) => e.code(),
            EngineError::Service(e) => e.code(),
            EngineError::PlanUnreadable(_) => "MIGRATE_ENGINE_PLAN_UNREADABLE",
            EngineError::TargetUserExists(_) => "MIGRATE_ENGINE_TARGET_USER_EXISTS",
            EngineError::Blocked { .. } => "MIGRATE_ENGINE_CONFLICTS",
            EngineError::Verification(_) => "MIGRATE_ENGINE_VERIFICATION",
            EngineError::Step { .. } => "MIGRATE_ENGINE_STEP_FAILED",
            EngineError::Rollback { .. } => "MIGRATE_ENGINE_ROLLBACK_INCOMPLETE",
            EngineError::PoolClosed => "MIGRATE_ENGINE_POOL_CLOSED",
            EngineError::Task(_) => "MIGRATE_ENGINE_TASK",
        }
    }

    /// Message safe to store on the job and return to operators.
    pub fn operator_message(&self) -> String {
        match self {
            EngineError::Archive(e) => e.operator_message(),
            EngineError::Job(e) => e.operator_message(),
            EngineError::Service(e) => e.operator_message(),
            EngineError::Step { step, source } => {
                format!("{} failed: {}", step, source.operator_message())
            }
            EngineError::Task(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_message_names_the_step_once() {
        let err = EngineError::Step {
            step: "post-restore verification",
            source: Box::new(EngineError::Verification("home directory is missing".to_string())),
        };
        assert_eq!(
            err.operator_message(),
            "post-restore verification failed: home directory is missing"
        );
        assert_eq!(err.code(), "MIGRATE_ENGINE_STEP_FAILED");
    }
}
