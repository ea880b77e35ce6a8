//! Migration engine
//!
//! - `preflight`: cheap backup checks shared by validate and analyze
//! - `analyzer`: validate, extract, parse and detect conflicts for one job
//! - `steps`: the ordered apply steps
//! - `orchestrator`: drives an approved job through the steps, fail-fast
//! - `pool`: fixed set of apply workers draining a FIFO queue
//! - `rollback`: best-effort reversal of a job's ledger
//!
//! Every phase reports through the `JobManager`; nothing here keeps job
//! state of its own.

pub mod analyzer;
mod errors;
pub mod orchestrator;
pub mod pool;
pub mod preflight;
pub mod rollback;
pub mod steps;

use std::sync::Arc;

use crate::archive::{DiskSpaceProbe, FixedSpaceProbe, StatvfsProbe};
use crate::config::MigrationConfig;
use crate::job::{FileJobStore, JobLogs, JobManager, MemoryJobStore};
use crate::services::ServiceError;
use crate::services::memory::InMemoryHost;
use crate::services::RestoreServices;

pub use analyzer::{analyze, spawn_analysis};
pub use errors::{EngineError, EngineResult};
pub use orchestrator::{blocking_conflicts, run_apply};
pub use pool::ApplyPool;
pub use preflight::{validate_backup, BackupReport};
pub use rollback::run_rollback;
pub use steps::ApplyStep;

/// Shared handles every phase needs. Cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<MigrationConfig>,
    pub jobs: Arc<JobManager>,
    pub services: RestoreServices,
    pub space: Arc<dyn DiskSpaceProbe>,
}

/// Run blocking filesystem work off the async workers.
pub(crate) async fn run_blocking<T, F>(f: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
}

impl EngineContext {
    /// Durable context for the local host.
    pub fn open(config: MigrationConfig) -> EngineResult<Self> {
        let store = FileJobStore::open(&config.state_dir)?;
        let jobs = JobManager::open(Arc::new(store), JobLogs::new(&config.state_dir))?;
        let services = RestoreServices::system(&config.home_root, &config.spool_dir)
            .map_err(|e| ServiceError::io(&config.spool_dir, e))?;
        Ok(Self {
            config: Arc::new(config),
            jobs: Arc::new(jobs),
            services,
            space: Arc::new(StatvfsProbe),
        })
    }

    /// Non-durable context over a simulated host reporting `available_bytes` free.
    pub fn in_memory(
        config: MigrationConfig,
        host: Arc<InMemoryHost>,
        available_bytes: u64,
    ) -> EngineResult<Self> {
        let jobs = JobManager::open(
            Arc::new(MemoryJobStore::new()),
            JobLogs::new(&config.state_dir),
        )?;
        Ok(Self {
            config: Arc::new(config),
            jobs: Arc::new(jobs),
            services: RestoreServices::in_memory(host),
            space: Arc::new(FixedSpaceProbe(available_bytes)),
        })
    }
}
