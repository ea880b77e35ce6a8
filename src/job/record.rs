//! Migration job records
//!
//! One record per migration attempt. Records are persisted as whole JSON
//! documents after every mutation and are never deleted automatically.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::MigrationStatus;
use crate::plan::{ComponentSet, MigrationPlan, OverwriteAuthorization, RestoreMode};

/// Provenance tag for legacy account backups.
pub const SOURCE_TYPE_BACKUP: &str = "cpanel_backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Full,
    Selective,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Full => "full",
            JobKind::Selective => "selective",
        }
    }
}

/// Artifacts created or replaced on the target by one job.
///
/// Rollback reverses exactly what is listed here and removes each entry once
/// it has been reversed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreLedger {
    #[serde(default)]
    pub identity_created: bool,
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub mailboxes: Vec<String>,
    #[serde(default)]
    pub dns_zones: Vec<String>,
    #[serde(default)]
    pub certificates: Vec<String>,
}

impl RestoreLedger {
    pub fn is_empty(&self) -> bool {
        !self.identity_created
            && self.directories.is_empty()
            && self.domains.is_empty()
            && self.databases.is_empty()
            && self.mailboxes.is_empty()
            && self.dns_zones.is_empty()
            && self.certificates.is_empty()
    }
}

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub source_path: PathBuf,
    pub target_user: String,
    pub dry_run: bool,
    pub components: ComponentSet,
    pub mode: RestoreMode,
    pub requested_by: Option<String>,
}

impl NewJob {
    /// Full migration of every component class.
    pub fn full(source_path: impl Into<PathBuf>, target_user: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Full,
            source_path: source_path.into(),
            target_user: target_user.into(),
            dry_run: false,
            components: ComponentSet::all(),
            mode: RestoreMode::Merge,
            requested_by: None,
        }
    }

    pub fn selective(
        source_path: impl Into<PathBuf>,
        target_user: impl Into<String>,
        components: ComponentSet,
        mode: RestoreMode,
    ) -> Self {
        Self {
            kind: JobKind::Selective,
            components,
            mode,
            ..Self::full(source_path, target_user)
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn requested_by(mut self, operator: Option<&str>) -> Self {
        self.requested_by = operator.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: MigrationStatus,
    pub progress: u8,
    pub current_step: String,

    pub source_type: String,
    pub source_path: PathBuf,
    pub target_user: String,
    pub dry_run: bool,

    pub components: ComponentSet,
    pub mode: RestoreMode,
    #[serde(default)]
    pub overwrite_existing: bool,

    /// Approved and waiting for an apply worker.
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub approval_seq: Option<u64>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,

    /// Serialized `MigrationPlan`, written once.
    #[serde(default)]
    pub plan: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failed_step: Option<String>,

    pub log_path: PathBuf,

    #[serde(default)]
    pub requested_by: Option<String>,

    #[serde(default)]
    pub ledger: RestoreLedger,
    #[serde(default)]
    pub rollback_in_progress: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    pub fn new(spec: NewJob, log_path: PathBuf) -> Self {
        Self::with_id(Uuid::new_v4(), spec, log_path)
    }

    pub(crate) fn with_id(id: Uuid, spec: NewJob, log_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: spec.kind,
            status: MigrationStatus::Pending,
            progress: 0,
            current_step: "queued for analysis".to_string(),
            source_type: SOURCE_TYPE_BACKUP.to_string(),
            source_path: spec.source_path,
            target_user: spec.target_user,
            dry_run: spec.dry_run,
            components: spec.components,
            mode: spec.mode,
            overwrite_existing: false,
            queued: false,
            approval_seq: None,
            approved_at: None,
            plan: None,
            error: None,
            failed_step: None,
            log_path,
            requested_by: spec.requested_by,
            ledger: RestoreLedger::default(),
            rollback_in_progress: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn has_plan(&self) -> bool {
        self.plan.is_some()
    }

    /// Analysis finished and nothing has been approved yet.
    pub fn is_awaiting_approval(&self) -> bool {
        self.status == MigrationStatus::Planning && self.has_plan() && !self.queued
    }

    /// Deserialize the attached plan.
    pub fn plan(&self) -> Option<serde_json::Result<MigrationPlan>> {
        self.plan.as_deref().map(MigrationPlan::from_blob)
    }

    /// Restore mode passed to collaborators.
    pub fn effective_mode(&self) -> RestoreMode {
        match self.kind {
            JobKind::Selective => self.mode,
            JobKind::Full if self.overwrite_existing => RestoreMode::Overwrite,
            JobKind::Full => RestoreMode::Merge,
        }
    }

    /// What the approved request allows to be replaced.
    pub fn authorization(&self) -> OverwriteAuthorization {
        match self.kind {
            JobKind::Full => OverwriteAuthorization {
                existing_user: self.overwrite_existing,
                existing_data: self.overwrite_existing,
            },
            JobKind::Selective => OverwriteAuthorization {
                existing_user: true,
                existing_data: self.overwrite_existing || self.mode == RestoreMode::Overwrite,
            },
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ComponentClass;

    #[test]
    fn test_new_job_defaults() {
        let job = MigrationJob::new(
            NewJob::full("/backups/cpmove-olduser.tar.gz", "alice"),
            PathBuf::from("/tmp/x.log"),
        );
        assert_eq!(job.status, MigrationStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.components.is_full());
        assert_eq!(job.source_type, SOURCE_TYPE_BACKUP);
        assert!(!job.is_awaiting_approval());
        assert!(job.ledger.is_empty());
    }

    #[test]
    fn test_effective_mode_and_authorization() {
        let mut full = MigrationJob::new(NewJob::full("/b.tar", "alice"), PathBuf::new());
        assert_eq!(full.effective_mode(), RestoreMode::Merge);
        assert_eq!(full.authorization(), OverwriteAuthorization::default());

        full.overwrite_existing = true;
        assert_eq!(full.effective_mode(), RestoreMode::Overwrite);
        assert!(full.authorization().existing_user);

        let components: ComponentSet = [ComponentClass::Email].into_iter().collect();
        let selective = MigrationJob::new(
            NewJob::selective("/b.tar", "alice", components, RestoreMode::Overwrite),
            PathBuf::new(),
        );
        let auth = selective.authorization();
        assert!(auth.existing_user);
        assert!(auth.existing_data);
        assert_eq!(selective.effective_mode(), RestoreMode::Overwrite);
    }

    #[test]
    fn test_record_survives_json() {
        let mut job = MigrationJob::new(NewJob::full("/b.tar", "alice"), PathBuf::from("/l"));
        job.ledger.domains.push("example.com".to_string());
        let json = serde_json::to_string(&job).unwrap();
        let back: MigrationJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
