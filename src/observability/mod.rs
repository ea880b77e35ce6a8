//! Observability for the migration agent
//!
//! - Structured JSON logging (`Logger`)
//! - Append-only audit trail of privileged operations (`audit`)
//!
//! ```ignore
//! use migrad::observability::Logger;
//!
//! Logger::info("MIGRATION_JOB_CREATED", &[("job_id", &id.to_string())]);
//! ```

pub mod audit;
mod logger;

pub use audit::{AuditLog, AuditOutcome, AuditRecord, FileAuditLog, MemoryAuditLog};
pub use logger::{Logger, Severity};
