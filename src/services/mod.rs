//! Restore collaborators
//!
//! Narrow interfaces the apply orchestrator and rollback engine drive, one
//! per restore step, plus the read-only target inventory and the
//! required-service probe. Implementations:
//! - `memory::InMemoryHost`: everything in one lock-protected table, with
//!   failure injection, for tests and offline previews
//! - `system`: system accounts, home directories, systemd probe
//! - `spool`: hand-off of database, mailbox, zone and certificate requests
//!   to the platform services through a spool directory
//!
//! Every restore call is idempotent: repeating it for an item that already
//! exists reports `Merged` or `Replaced` instead of failing.

use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::confined_path;
use crate::plan::{
    MigrationDatabase, MigrationDnsZone, MigrationDomain, MigrationEmail, MigrationSsl,
    RestoreMode,
};

pub mod memory;
pub mod spool;
pub mod system;

/// Result type for collaborator calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Boxed future returned by collaborator calls
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = ServiceResult<T>> + Send + 'a>>;

/// Typed collaborator failures.
///
/// Messages may carry raw downstream detail; they are logged, never returned
/// to operators as-is.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} is unavailable: {detail}")]
    Unavailable { service: String, detail: String },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{operation} failed: {detail}")]
    Failed { operation: String, detail: String },

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ServiceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn failed(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failed {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Short description without downstream output or host paths.
    pub fn operator_message(&self) -> String {
        match self {
            ServiceError::Unavailable { service, .. } => format!("{} is unavailable", service),
            ServiceError::AlreadyExists(subject) => format!("{} already exists", subject),
            ServiceError::NotFound(subject) => format!("{} not found", subject),
            ServiceError::Failed { operation, .. } => format!("{} failed", operation),
            ServiceError::Command { program, .. } => format!("{} reported an error", program),
            ServiceError::Io { .. } => "filesystem error".to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Unavailable { .. } => "MIGRATE_SERVICE_UNAVAILABLE",
            ServiceError::AlreadyExists(_) => "MIGRATE_SERVICE_ALREADY_EXISTS",
            ServiceError::NotFound(_) => "MIGRATE_SERVICE_NOT_FOUND",
            ServiceError::Failed { .. } => "MIGRATE_SERVICE_FAILED",
            ServiceError::Command { .. } => "MIGRATE_SERVICE_COMMAND",
            ServiceError::Io { .. } => "MIGRATE_SERVICE_IO",
        }
    }
}

/// What a restore call did to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// Did not exist before; created by this job
    Created,
    /// Existed and was replaced (overwrite mode)
    Replaced,
    /// Existed and was kept (merge mode)
    Merged,
}

impl RestoreOutcome {
    /// Whether the item belongs in the job's rollback ledger.
    pub fn touched_target(&self) -> bool {
        matches!(self, RestoreOutcome::Created | RestoreOutcome::Replaced)
    }
}

/// Everything a restore call needs to know about the running job.
#[derive(Debug, Clone)]
pub struct RestoreContext {
    pub job_id: Uuid,
    pub target_user: String,
    /// Root of the freshly extracted backup content
    pub content_root: PathBuf,
    pub mode: RestoreMode,
}

impl RestoreContext {
    /// Absolute path of a plan-relative file. Paths that leave the
    /// extracted backup are refused.
    pub fn content_path(&self, relative: &str) -> ServiceResult<PathBuf> {
        confined_path(&self.content_root, relative).ok_or_else(|| {
            ServiceError::failed(
                "read backup content",
                format!("{} resolves outside the backup root", relative),
            )
        })
    }
}

/// Post-restore facts about the target account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFacts {
    pub exists: bool,
    pub home_dir: Option<PathBuf>,
    pub home_exists: bool,
    pub ownership_ok: bool,
}

/// Directories and domains created by the tree step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeOutcome {
    pub directories: Vec<String>,
    pub domains: Vec<String>,
}

pub trait IdentityProvisioner: Send + Sync {
    /// Create the account, or report `Merged` when it already exists.
    fn create_account<'a>(&'a self, ctx: &'a RestoreContext) -> ServiceFuture<'a, RestoreOutcome>;

    fn remove_account<'a>(&'a self, user: &'a str) -> ServiceFuture<'a, ()>;

    fn verify_account<'a>(&'a self, user: &'a str) -> ServiceFuture<'a, AccountFacts>;
}

pub trait FilesystemRestorer: Send + Sync {
    /// Home directory skeleton, per-domain document roots, domain registration.
    fn create_tree<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        domains: &'a [MigrationDomain],
    ) -> ServiceFuture<'a, TreeOutcome>;

    /// Copy `homedir/` content into the account home. Returns bytes copied.
    fn restore_home<'a>(&'a self, ctx: &'a RestoreContext) -> ServiceFuture<'a, u64>;

    fn remove_tree<'a>(
        &'a self,
        user: &'a str,
        directories: &'a [String],
        domains: &'a [String],
    ) -> ServiceFuture<'a, ()>;
}

pub trait DatabaseRestorer: Send + Sync {
    fn restore_database<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        database: &'a MigrationDatabase,
        target_name: &'a str,
        target_db_user: Option<&'a str>,
    ) -> ServiceFuture<'a, RestoreOutcome>;

    fn drop_database<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()>;
}

pub trait MailboxRestorer: Send + Sync {
    fn restore_mailbox<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        mailbox: &'a MigrationEmail,
    ) -> ServiceFuture<'a, RestoreOutcome>;

    fn remove_mailbox<'a>(&'a self, address: &'a str) -> ServiceFuture<'a, ()>;
}

pub trait DnsRestorer: Send + Sync {
    fn restore_zone<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        zone: &'a MigrationDnsZone,
    ) -> ServiceFuture<'a, RestoreOutcome>;

    fn remove_zone<'a>(&'a self, zone_name: &'a str) -> ServiceFuture<'a, ()>;
}

pub trait CertificateRestorer: Send + Sync {
    fn install_certificate<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        certificate: &'a MigrationSsl,
    ) -> ServiceFuture<'a, RestoreOutcome>;

    fn remove_certificate<'a>(&'a self, domain: &'a str) -> ServiceFuture<'a, ()>;
}

/// Read-only view of what already exists on the target.
pub trait TargetInventory: Send + Sync {
    fn user_exists(&self, user: &str) -> ServiceResult<bool>;

    fn domain_owner(&self, domain: &str) -> ServiceResult<Option<String>>;

    fn database_owner(&self, database: &str) -> ServiceResult<Option<String>>;

    fn mailbox_exists(&self, address: &str) -> ServiceResult<bool>;
}

/// Checks that the platform services a restore depends on are running.
pub trait ServiceProbe: Send + Sync {
    /// Names from `required` that are not running.
    fn missing_services<'a>(&'a self, required: &'a [String]) -> ServiceFuture<'a, Vec<String>>;
}

/// The full set of collaborators, cheap to clone.
#[derive(Clone)]
pub struct RestoreServices {
    pub identity: Arc<dyn IdentityProvisioner>,
    pub filesystem: Arc<dyn FilesystemRestorer>,
    pub databases: Arc<dyn DatabaseRestorer>,
    pub mailboxes: Arc<dyn MailboxRestorer>,
    pub dns: Arc<dyn DnsRestorer>,
    pub certificates: Arc<dyn CertificateRestorer>,
    pub inventory: Arc<dyn TargetInventory>,
    pub probe: Arc<dyn ServiceProbe>,
}

impl RestoreServices {
    /// Collaborators for the local host: system accounts and home
    /// directories, platform services through the spool at `spool_dir`.
    pub fn system(home_root: &Path, spool_dir: &Path) -> io::Result<Self> {
        let spool = spool::SpoolServices::open(spool_dir)?;
        Ok(Self {
            identity: Arc::new(system::SystemAccounts::new(home_root)),
            filesystem: Arc::new(system::HomeFilesystem::new(home_root, spool.clone())),
            databases: Arc::new(spool.clone()),
            mailboxes: Arc::new(spool.clone()),
            dns: Arc::new(spool.clone()),
            certificates: Arc::new(spool.clone()),
            inventory: Arc::new(system::HostInventory::new(spool)),
            probe: Arc::new(system::SystemctlProbe),
        })
    }

    /// Every collaborator backed by one in-memory host.
    pub fn in_memory(host: Arc<memory::InMemoryHost>) -> Self {
        Self {
            identity: host.clone(),
            filesystem: host.clone(),
            databases: host.clone(),
            mailboxes: host.clone(),
            dns: host.clone(),
            certificates: host.clone(),
            inventory: host.clone(),
            probe: host,
        }
    }
}

/// Recursively copy regular files and directories. Returns bytes copied.
///
/// Existing files are kept unless `replace` is set.
pub(crate) fn copy_tree(src: &Path, dst: &Path, replace: bool) -> io::Result<u64> {
    let meta = fs::symlink_metadata(src)?;
    if meta.is_file() {
        if !replace && dst.exists() {
            return Ok(0);
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        return fs::copy(src, dst);
    }
    if !meta.is_dir() {
        return Ok(0);
    }

    fs::create_dir_all(dst)?;
    let mut total = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        total += copy_tree(&entry.path(), &dst.join(entry.file_name()), replace)?;
    }
    Ok(total)
}

/// Run blocking filesystem work off the async workers.
pub(crate) async fn run_blocking<T, F>(f: F) -> ServiceResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::failed("blocking task", e.to_string()))?
}

/// Insert into a name -> owner table, honoring the restore mode.
pub(crate) fn upsert_owned(
    table: &mut BTreeMap<String, String>,
    key: &str,
    owner: &str,
    mode: RestoreMode,
) -> ServiceResult<RestoreOutcome> {
    match table.get(key) {
        None => {
            table.insert(key.to_string(), owner.to_string());
            Ok(RestoreOutcome::Created)
        }
        Some(existing) if existing != owner => Err(ServiceError::AlreadyExists(key.to_string())),
        Some(_) => match mode {
            RestoreMode::Merge => Ok(RestoreOutcome::Merged),
            RestoreMode::Overwrite => Ok(RestoreOutcome::Replaced),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_counts_bytes() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/f"), b"12345").unwrap();
        fs::write(src.path().join("top"), b"xy").unwrap();

        let dst = TempDir::new().unwrap();
        let target = dst.path().join("copy");
        assert_eq!(copy_tree(src.path(), &target, false).unwrap(), 7);
        assert_eq!(fs::read(target.join("a/b/f")).unwrap(), b"12345");

        fs::write(target.join("top"), b"kept").unwrap();
        assert_eq!(copy_tree(src.path(), &target, false).unwrap(), 0);
        assert_eq!(fs::read(target.join("top")).unwrap(), b"kept");
        assert_eq!(copy_tree(src.path(), &target, true).unwrap(), 7);
    }

    #[test]
    fn test_outcome_ledger_rule() {
        assert!(RestoreOutcome::Created.touched_target());
        assert!(RestoreOutcome::Replaced.touched_target());
        assert!(!RestoreOutcome::Merged.touched_target());
    }
}
