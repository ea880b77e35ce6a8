//! Job manager
//!
//! Owns every job record. All mutations go through here:
//! - validated against the state machine
//! - persisted before they become visible
//! - logged to the process log and the job's own log
//!
//! One instance is created at startup and passed explicitly to the analyzer,
//! the apply pool and the agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use super::errors::{JobError, JobResult};
use super::joblog::{self, JobLogs};
use super::record::{MigrationJob, NewJob, RestoreLedger};
use super::state::{progress, MigrationStatus};
use super::store::JobStore;
use crate::observability::{Logger, Severity};
use crate::plan::MigrationPlan;

pub const INTERRUPTED_ERROR: &str = "interrupted by agent restart";
pub const AWAITING_APPROVAL_STEP: &str = "awaiting approval";

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<MigrationStatus>,
    pub target_user: Option<String>,
}

impl JobFilter {
    fn matches(&self, job: &MigrationJob) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .target_user
                .as_deref()
                .map_or(true, |u| job.target_user == u)
    }
}

/// Result of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Marked failed because a phase was running
    pub interrupted: Vec<Uuid>,
    /// Approved jobs to hand back to the apply pool, in approval order
    pub requeued: Vec<Uuid>,
    /// Created but never analyzed
    pub reanalyze: Vec<Uuid>,
}

pub struct JobManager {
    jobs: Mutex<HashMap<Uuid, MigrationJob>>,
    store: Arc<dyn JobStore>,
    logs: JobLogs,
    next_approval_seq: AtomicU64,
}

impl JobManager {
    /// Load every persisted record.
    pub fn open(store: Arc<dyn JobStore>, logs: JobLogs) -> JobResult<Self> {
        let loaded = store.load_all()?;
        let next_seq = loaded
            .iter()
            .filter_map(|j| j.approval_seq)
            .max()
            .map_or(0, |s| s + 1);

        Ok(Self {
            jobs: Mutex::new(loaded.into_iter().map(|j| (j.id, j)).collect()),
            store,
            logs,
            next_approval_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn create(&self, spec: NewJob) -> JobResult<MigrationJob> {
        let id = Uuid::new_v4();
        let job = MigrationJob::with_id(id, spec, self.logs.path_for(id));

        let mut jobs = self.jobs.lock().map_err(|_| JobError::LockPoisoned)?;
        self.store.save(&job)?;
        jobs.insert(id, job.clone());
        drop(jobs);

        Logger::info(
            "MIGRATION_JOB_CREATED",
            &[
                ("job_id", &id.to_string()),
                ("kind", job.kind.as_str()),
                ("target_user", &job.target_user),
            ],
        );
        self.note(&job, Severity::Info, &format!(
            "{} job created for {} from {}",
            job.kind.as_str(),
            job.target_user,
            job.source_path.display()
        ));
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> JobResult<MigrationJob> {
        self.jobs
            .lock()
            .map_err(|_| JobError::LockPoisoned)?
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound(id))
    }

    /// Matching jobs, oldest first.
    pub fn list(&self, filter: &JobFilter) -> JobResult<Vec<MigrationJob>> {
        let jobs = self.jobs.lock().map_err(|_| JobError::LockPoisoned)?;
        let mut out: Vec<MigrationJob> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    /// Apply `f` to a copy of the record, persist, then publish.
    fn update<F>(&self, id: Uuid, f: F) -> JobResult<MigrationJob>
    where
        F: FnOnce(&mut MigrationJob) -> JobResult<()>,
    {
        let mut jobs = self.jobs.lock().map_err(|_| JobError::LockPoisoned)?;
        let mut job = jobs.get(&id).cloned().ok_or(JobError::NotFound(id))?;
        f(&mut job)?;
        job.touch();
        self.store.save(&job)?;
        jobs.insert(id, job.clone());
        Ok(job)
    }

    fn apply_transition(job: &mut MigrationJob, next: MigrationStatus) -> JobResult<()> {
        if !job.status.can_transition_to(next) {
            return Err(JobError::invalid_state(
                job.id,
                job.status,
                &format!("move to {}", next),
            ));
        }
        job.status = next;
        if next == MigrationStatus::Validating {
            job.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    fn log_transition(&self, job: &MigrationJob, from: MigrationStatus) {
        Logger::info(
            "MIGRATION_JOB_TRANSITION",
            &[
                ("from", from.as_str()),
                ("job_id", &job.id.to_string()),
                ("progress", &job.progress.to_string()),
                ("step", &job.current_step),
                ("to", job.status.as_str()),
            ],
        );
        self.note(job, Severity::Info, &format!(
            "{} -> {} ({}%): {}",
            from, job.status, job.progress, job.current_step
        ));
    }

    /// Move to `next`, setting the step label and raising progress.
    pub fn transition(
        &self,
        id: Uuid,
        next: MigrationStatus,
        step: &str,
        percent: u8,
    ) -> JobResult<MigrationJob> {
        let mut from = next;
        let job = self.update(id, |job| {
            from = job.status;
            Self::apply_transition(job, next)?;
            job.current_step = step.to_string();
            job.progress = job.progress.max(percent.min(progress::COMPLETE));
            Ok(())
        })?;
        self.log_transition(&job, from);
        Ok(job)
    }

    /// Update the step label and progress within the current state.
    ///
    /// Progress never decreases.
    pub fn progress(&self, id: Uuid, step: &str, percent: u8) -> JobResult<MigrationJob> {
        let job = self.update(id, |job| {
            if job.status.is_terminal() {
                return Err(JobError::invalid_state(job.id, job.status, "report progress"));
            }
            job.current_step = step.to_string();
            job.progress = job.progress.max(percent.min(progress::COMPLETE));
            Ok(())
        })?;
        self.note(&job, Severity::Info, &format!("{}% {}", job.progress, step));
        Ok(job)
    }

    /// Attach the analysis result. Allowed once, while planning.
    pub fn attach_plan(&self, id: Uuid, plan: &MigrationPlan) -> JobResult<MigrationJob> {
        let blob = plan.to_blob().map_err(|e| JobError::Corrupt {
            path: self.logs.path_for(id),
            detail: e.to_string(),
        })?;
        let job = self.update(id, |job| {
            if job.has_plan() {
                return Err(JobError::PlanAlreadyAttached(job.id));
            }
            if job.status != MigrationStatus::Planning {
                return Err(JobError::invalid_state(job.id, job.status, "attach a plan"));
            }
            job.plan = Some(blob);
            job.current_step = AWAITING_APPROVAL_STEP.to_string();
            job.progress = job.progress.max(progress::AWAITING_APPROVAL);
            Ok(())
        })?;
        let summary = plan.summary();
        Logger::info(
            "MIGRATION_PLAN_ATTACHED",
            &[
                ("conflicts", &summary.conflicts.to_string()),
                ("job_id", &id.to_string()),
                ("warnings", &summary.warnings.to_string()),
            ],
        );
        self.note(&job, Severity::Info, &format!(
            "plan attached: {} domains, {} mailboxes, {} databases, {} zones, {} certificates",
            summary.domains,
            summary.email_accounts,
            summary.databases,
            summary.dns_zones,
            summary.ssl_certificates
        ));
        Ok(job)
    }

    /// Move to `failed`, recording the failing step. Progress is kept.
    pub fn fail(&self, id: Uuid, step: &str, error: &str) -> JobResult<MigrationJob> {
        let mut from = MigrationStatus::Failed;
        let job = self.update(id, |job| {
            from = job.status;
            Self::apply_transition(job, MigrationStatus::Failed)?;
            job.current_step = step.to_string();
            job.failed_step = Some(step.to_string());
            job.error = Some(error.to_string());
            job.queued = false;
            Ok(())
        })?;
        Logger::error(
            "MIGRATION_JOB_FAILED",
            &[
                ("error", error),
                ("from", from.as_str()),
                ("job_id", &id.to_string()),
                ("step", step),
            ],
        );
        self.note(&job, Severity::Error, &format!("failed at {}: {}", step, error));
        Ok(job)
    }

    /// The job can take an approval: analyzed, not a dry run, not yet queued.
    pub fn check_approvable(&self, id: Uuid) -> JobResult<MigrationJob> {
        let job = self.get(id)?;
        Self::ensure_approvable(&job)?;
        Ok(job)
    }

    fn ensure_approvable(job: &MigrationJob) -> JobResult<()> {
        if job.dry_run {
            return Err(JobError::invalid_state(job.id, job.status, "apply a dry-run job"));
        }
        if job.status != MigrationStatus::Planning || job.queued {
            return Err(JobError::invalid_state(job.id, job.status, "apply"));
        }
        if !job.has_plan() {
            return Err(JobError::PlanMissing(job.id));
        }
        Ok(())
    }

    /// Record an approval and mark the job queued for a worker.
    pub fn approve(&self, id: Uuid, overwrite_existing: bool) -> JobResult<MigrationJob> {
        let seq = self.next_approval_seq.fetch_add(1, Ordering::SeqCst);
        let job = self.update(id, |job| {
            Self::ensure_approvable(job)?;
            job.queued = true;
            job.overwrite_existing = overwrite_existing;
            job.approval_seq = Some(seq);
            job.approved_at = Some(Utc::now());
            job.current_step = "queued for apply".to_string();
            Ok(())
        })?;
        Logger::info(
            "MIGRATION_JOB_APPROVED",
            &[
                ("job_id", &id.to_string()),
                ("overwrite_existing", &overwrite_existing.to_string()),
                ("seq", &seq.to_string()),
            ],
        );
        self.note(&job, Severity::Info, "approved, waiting for an apply worker");
        Ok(job)
    }

    /// Undo `approve` for a job no worker will ever claim.
    pub fn withdraw_approval(&self, id: Uuid) -> JobResult<MigrationJob> {
        let job = self.update(id, |job| {
            if job.status != MigrationStatus::Planning || !job.queued {
                return Err(JobError::invalid_state(job.id, job.status, "withdraw approval"));
            }
            job.queued = false;
            job.approval_seq = None;
            job.approved_at = None;
            job.current_step = AWAITING_APPROVAL_STEP.to_string();
            Ok(())
        })?;
        Logger::warn("MIGRATION_JOB_APPROVAL_WITHDRAWN", &[("job_id", &id.to_string())]);
        self.note(&job, Severity::Warn, "approval withdrawn, apply was not queued");
        Ok(job)
    }

    /// A worker takes a queued job: `planning -> applying`.
    pub fn claim(&self, id: Uuid, step: &str) -> JobResult<MigrationJob> {
        let mut from = MigrationStatus::Planning;
        let job = self.update(id, |job| {
            if !job.queued {
                return Err(JobError::invalid_state(job.id, job.status, "start apply without approval"));
            }
            from = job.status;
            Self::apply_transition(job, MigrationStatus::Applying)?;
            job.queued = false;
            job.current_step = step.to_string();
            job.progress = job.progress.max(progress::APPLY_START);
            Ok(())
        })?;
        self.log_transition(&job, from);
        Ok(job)
    }

    /// Merge newly created artifacts into the rollback ledger.
    pub fn record_artifacts<F>(&self, id: Uuid, f: F) -> JobResult<MigrationJob>
    where
        F: FnOnce(&mut RestoreLedger),
    {
        self.update(id, |job| {
            f(&mut job.ledger);
            Ok(())
        })
    }

    /// Guard a rollback: job is complete or failed and no rollback is running.
    pub fn begin_rollback(&self, id: Uuid) -> JobResult<MigrationJob> {
        let job = self.update(id, |job| {
            if !job.status.is_rollback_eligible() || job.rollback_in_progress {
                return Err(JobError::invalid_state(job.id, job.status, "roll back"));
            }
            job.rollback_in_progress = true;
            job.current_step = "rolling back".to_string();
            Ok(())
        })?;
        self.note(&job, Severity::Info, "rollback started");
        Ok(job)
    }

    /// Record the rollback result with what is left to reverse.
    pub fn finish_rollback(
        &self,
        id: Uuid,
        remaining: RestoreLedger,
        failure: Option<&str>,
    ) -> JobResult<MigrationJob> {
        let mut from = MigrationStatus::RolledBack;
        let job = self.update(id, |job| {
            from = job.status;
            job.rollback_in_progress = false;
            job.ledger = remaining;
            match failure {
                None => {
                    Self::apply_transition(job, MigrationStatus::RolledBack)?;
                    job.current_step = "rolled back".to_string();
                }
                Some(error) => {
                    if job.status != MigrationStatus::Failed {
                        Self::apply_transition(job, MigrationStatus::Failed)?;
                    }
                    job.current_step = "rollback".to_string();
                    job.failed_step = Some("rollback".to_string());
                    job.error = Some(error.to_string());
                }
            }
            Ok(())
        })?;
        self.log_transition(&job, from);
        Ok(job)
    }

    /// Startup recovery.
    ///
    /// Jobs caught mid-analysis or mid-apply are failed; approved jobs are
    /// returned in approval order for resubmission.
    pub fn recover(&self) -> JobResult<RecoveryReport> {
        let snapshot: Vec<MigrationJob> = self
            .jobs
            .lock()
            .map_err(|_| JobError::LockPoisoned)?
            .values()
            .cloned()
            .collect();

        let mut report = RecoveryReport::default();
        let mut queued = Vec::new();

        for job in snapshot {
            let analyzing = job.status == MigrationStatus::Planning && !job.has_plan();
            if job.status.is_in_flight() || analyzing {
                let step = job.current_step.clone();
                self.fail(job.id, &step, INTERRUPTED_ERROR)?;
                report.interrupted.push(job.id);
            } else if job.status == MigrationStatus::Pending {
                report.reanalyze.push(job.id);
            } else if job.status == MigrationStatus::Planning && job.queued {
                queued.push((job.approval_seq.unwrap_or(u64::MAX), job.created_at, job.id));
            }

            if job.rollback_in_progress {
                self.update(job.id, |j| {
                    j.rollback_in_progress = false;
                    Ok(())
                })?;
            }
        }

        queued.sort();
        report.requeued = queued.into_iter().map(|(_, _, id)| id).collect();

        Logger::info(
            "MIGRATION_RECOVERY_COMPLETE",
            &[
                ("interrupted", &report.interrupted.len().to_string()),
                ("reanalyze", &report.reanalyze.len().to_string()),
                ("requeued", &report.requeued.len().to_string()),
            ],
        );
        Ok(report)
    }

    /// Append a line to the job's execution log.
    pub fn note(&self, job: &MigrationJob, severity: Severity, message: &str) {
        joblog::append(&job.log_path, severity, message);
    }

    /// Append by id; unknown ids are ignored.
    pub fn note_id(&self, id: Uuid, severity: Severity, message: &str) {
        if let Ok(job) = self.get(id) {
            self.note(&job, severity, message);
        }
    }

    /// Full execution log of a job.
    pub fn read_log(&self, id: Uuid) -> JobResult<String> {
        let job = self.get(id)?;
        joblog::read(&job.log_path).map_err(|e| JobError::store(&job.log_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::store::MemoryJobStore;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> JobManager {
        JobManager::open(Arc::new(MemoryJobStore::new()), JobLogs::new(dir.path())).unwrap()
    }

    fn analyzed(manager: &JobManager) -> MigrationJob {
        let job = manager.create(NewJob::full("/b/cpmove-alice.tar", "alice")).unwrap();
        manager.transition(job.id, MigrationStatus::Validating, "validating backup", 10).unwrap();
        manager.transition(job.id, MigrationStatus::Extracting, "extracting backup", 25).unwrap();
        manager.transition(job.id, MigrationStatus::Planning, "parsing backup", 40).unwrap();
        manager.attach_plan(job.id, &MigrationPlan::new("alice", "alice")).unwrap()
    }

    #[test]
    fn test_analysis_reaches_awaiting_approval() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let job = analyzed(&manager);

        assert!(job.is_awaiting_approval());
        assert_eq!(job.progress, 50);
        assert_eq!(job.current_step, AWAITING_APPROVAL_STEP);
        assert!(job.updated_at >= job.created_at);
        assert!(manager.read_log(job.id).unwrap().contains("plan attached"));
    }

    #[test]
    fn test_plan_attached_once() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let job = analyzed(&manager);

        let err = manager
            .attach_plan(job.id, &MigrationPlan::new("alice", "alice"))
            .unwrap_err();
        assert_eq!(err.code(), "MIGRATE_JOB_PLAN_ATTACHED");
    }

    #[test]
    fn test_illegal_transition_leaves_job_untouched() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let job = manager.create(NewJob::full("/b.tar", "alice")).unwrap();

        let err = manager
            .transition(job.id, MigrationStatus::Applying, "x", 60)
            .unwrap_err();
        assert_eq!(err.code(), "MIGRATE_JOB_INVALID_STATE");
        assert_eq!(manager.get(job.id).unwrap(), job);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let job = analyzed(&manager);
        let job = manager.progress(job.id, "still here", 20).unwrap();
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn test_fail_keeps_progress_and_step() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let job = manager.create(NewJob::full("/b.tar", "alice")).unwrap();
        manager.transition(job.id, MigrationStatus::Validating, "validating backup", 10).unwrap();

        let failed = manager.fail(job.id, "validating backup", "unknown backup format").unwrap();
        assert_eq!(failed.status, MigrationStatus::Failed);
        assert_eq!(failed.progress, 10);
        assert_eq!(failed.failed_step.as_deref(), Some("validating backup"));
        assert!(failed.finished_at.is_some());
    }

    #[test]
    fn test_approve_requires_analyzed_job() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let fresh = manager.create(NewJob::full("/b.tar", "alice")).unwrap();
        assert!(manager.approve(fresh.id, false).is_err());

        let dry = manager
            .create(NewJob::full("/b.tar", "alice").dry_run(true))
            .unwrap();
        manager.transition(dry.id, MigrationStatus::Validating, "v", 10).unwrap();
        manager.transition(dry.id, MigrationStatus::Extracting, "e", 25).unwrap();
        manager.transition(dry.id, MigrationStatus::Planning, "p", 40).unwrap();
        manager.attach_plan(dry.id, &MigrationPlan::new("alice", "alice")).unwrap();
        assert_eq!(
            manager.approve(dry.id, false).unwrap_err().code(),
            "MIGRATE_JOB_INVALID_STATE"
        );

        let job = analyzed(&manager);
        let approved = manager.approve(job.id, true).unwrap();
        assert!(approved.queued);
        assert!(approved.overwrite_existing);
        assert!(manager.approve(job.id, true).is_err());
    }

    #[test]
    fn test_withdrawn_approval_can_be_approved_again() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let job = analyzed(&manager);
        assert!(manager.withdraw_approval(job.id).is_err());

        manager.approve(job.id, false).unwrap();
        let withdrawn = manager.withdraw_approval(job.id).unwrap();
        assert!(!withdrawn.queued);
        assert!(withdrawn.approval_seq.is_none());
        assert!(withdrawn.is_awaiting_approval());
        assert!(manager.claim(job.id, "create target identity").is_err());

        assert!(manager.approve(job.id, true).unwrap().queued);
    }

    #[test]
    fn test_rollback_guard() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let job = analyzed(&manager);
        assert_eq!(
            manager.begin_rollback(job.id).unwrap_err().code(),
            "MIGRATE_JOB_INVALID_STATE"
        );

        manager.approve(job.id, false).unwrap();
        manager.claim(job.id, "prepare backup content").unwrap();
        manager.fail(job.id, "restore databases", "boom").unwrap();

        manager.begin_rollback(job.id).unwrap();
        assert!(manager.begin_rollback(job.id).is_err());

        let done = manager
            .finish_rollback(job.id, RestoreLedger::default(), None)
            .unwrap();
        assert_eq!(done.status, MigrationStatus::RolledBack);
        assert!(!done.rollback_in_progress);
    }

    #[test]
    fn test_recover_fails_interrupted_and_requeues_in_order() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let first = JobManager::open(store.clone(), JobLogs::new(dir.path())).unwrap();

        let a = analyzed(&first);
        let b = analyzed(&first);
        let c = analyzed(&first);
        first.approve(b.id, false).unwrap();
        first.approve(a.id, false).unwrap();
        first.approve(c.id, false).unwrap();
        first.claim(c.id, "prepare backup content").unwrap();
        let pending = first.create(NewJob::full("/b.tar", "dave")).unwrap();

        let second = JobManager::open(store, JobLogs::new(dir.path())).unwrap();
        let report = second.recover().unwrap();

        assert_eq!(report.requeued, vec![b.id, a.id]);
        assert_eq!(report.interrupted, vec![c.id]);
        assert_eq!(report.reanalyze, vec![pending.id]);

        let c = second.get(c.id).unwrap();
        assert_eq!(c.status, MigrationStatus::Failed);
        assert_eq!(c.error.as_deref(), Some(INTERRUPTED_ERROR));
    }
}
