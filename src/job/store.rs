//! Durable job records
//!
//! One JSON document per job at `<state_dir>/jobs/<id>.json`. Writes go to a
//! temp file, are fsynced, then renamed over the record.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use super::errors::{JobError, JobResult};
use super::record::MigrationJob;

const JOBS_DIR: &str = "jobs";

pub trait JobStore: Send + Sync {
    /// Persist the whole record, replacing any previous version.
    fn save(&self, job: &MigrationJob) -> JobResult<()>;

    /// Every persisted record, in no particular order.
    fn load_all(&self) -> JobResult<Vec<MigrationJob>>;
}

pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn open(state_dir: &Path) -> JobResult<Self> {
        let dir = state_dir.join(JOBS_DIR);
        fs::create_dir_all(&dir).map_err(|e| JobError::store(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl JobStore for FileJobStore {
    fn save(&self, job: &MigrationJob) -> JobResult<()> {
        let path = self.record_path(job.id);
        let temp = self.dir.join(format!("{}.json.tmp", job.id));

        let content = serde_json::to_vec_pretty(job).map_err(|e| JobError::Corrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .map_err(|e| JobError::store(&temp, e))?;
        file.write_all(&content).map_err(|e| JobError::store(&temp, e))?;
        file.sync_all().map_err(|e| JobError::store(&temp, e))?;
        drop(file);

        fs::rename(&temp, &path).map_err(|e| JobError::store(&path, e))?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn load_all(&self) -> JobResult<Vec<MigrationJob>> {
        let mut jobs = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| JobError::store(&self.dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| JobError::store(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| JobError::store(&path, e))?;
            let job = serde_json::from_slice(&bytes).map_err(|e| JobError::Corrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            jobs.push(job);
        }
        Ok(jobs)
    }
}

/// Non-durable store for tests and offline inspection.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, MigrationJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-existing records, as if written by an earlier process.
    pub fn seeded(jobs: impl IntoIterator<Item = MigrationJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().map(|j| (j.id, j)).collect()),
        }
    }
}

impl JobStore for MemoryJobStore {
    fn save(&self, job: &MigrationJob) -> JobResult<()> {
        self.jobs
            .lock()
            .map_err(|_| JobError::LockPoisoned)?
            .insert(job.id, job.clone());
        Ok(())
    }

    fn load_all(&self) -> JobResult<Vec<MigrationJob>> {
        Ok(self
            .jobs
            .lock()
            .map_err(|_| JobError::LockPoisoned)?
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::record::NewJob;
    use crate::job::state::MigrationStatus;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_replaces_record() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();

        let mut job = MigrationJob::new(NewJob::full("/b.tar", "alice"), dir.path().join("l"));
        store.save(&job).unwrap();
        job.status = MigrationStatus::Validating;
        store.save(&job).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, MigrationStatus::Validating);
        assert!(store.record_path(job.id).exists());
        assert!(!dir.path().join("jobs").join(format!("{}.json.tmp", job.id)).exists());
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("jobs/bad.json"), b"{not json").unwrap();

        let err = store.load_all().unwrap_err();
        assert_eq!(err.code(), "MIGRATE_JOB_CORRUPT");
    }
}
