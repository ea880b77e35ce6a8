//! Migration jobs
//!
//! - `state`: the status state machine and progress checkpoints
//! - `record`: the persisted job record and its rollback ledger
//! - `store`: durable one-document-per-job storage
//! - `manager`: the single owner of job records
//! - `approval`: single-use approval and overwrite-confirmation tokens
//! - `joblog`: per-job execution logs

pub mod approval;
mod errors;
pub mod joblog;
pub mod manager;
pub mod record;
pub mod state;
pub mod store;

pub use approval::{ApprovalRegistry, IssuedToken, TokenPurpose};
pub use errors::{JobError, JobResult};
pub use joblog::JobLogs;
pub use manager::{
    JobFilter, JobManager, RecoveryReport, AWAITING_APPROVAL_STEP, INTERRUPTED_ERROR,
};
pub use record::{JobKind, MigrationJob, NewJob, RestoreLedger, SOURCE_TYPE_BACKUP};
pub use state::{progress, MigrationStatus};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
