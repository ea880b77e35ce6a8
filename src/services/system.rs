//! Host-backed collaborators
//!
//! - `SystemAccounts`: `useradd` / `userdel`, verification through the
//!   passwd database and home directory ownership
//! - `HomeFilesystem`: home skeleton, document roots, home content copy
//! - `SystemctlProbe`: `systemctl is-active` for required services
//! - `HostInventory`: passwd lookups plus the spool registry

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use nix::unistd::{chown, Gid, Uid, User};
use tokio::process::Command;

use super::spool::SpoolServices;
use super::{
    copy_tree, run_blocking, AccountFacts, FilesystemRestorer, IdentityProvisioner,
    RestoreContext, RestoreOutcome, ServiceError, ServiceFuture, ServiceProbe, ServiceResult,
    TargetInventory, TreeOutcome,
};
use crate::observability::Logger;
use crate::plan::{MigrationDomain, RestoreMode};

const DEFAULT_SHELL: &str = "/bin/bash";

fn lookup_user(name: &str) -> ServiceResult<Option<User>> {
    User::from_name(name).map_err(|errno| ServiceError::failed("passwd lookup", errno.to_string()))
}

async fn run_command(program: &str, args: &[&str]) -> ServiceResult<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ServiceError::Unavailable {
            service: program.to_string(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(());
    }
    Err(ServiceError::Command {
        program: program.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// System account provisioning.
#[derive(Debug, Clone)]
pub struct SystemAccounts {
    home_root: PathBuf,
}

impl SystemAccounts {
    pub fn new(home_root: impl Into<PathBuf>) -> Self {
        Self {
            home_root: home_root.into(),
        }
    }
}

impl IdentityProvisioner for SystemAccounts {
    fn create_account<'a>(&'a self, ctx: &'a RestoreContext) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            if lookup_user(&ctx.target_user)?.is_some() {
                return Ok(RestoreOutcome::Merged);
            }
            let home = self.home_root.join(&ctx.target_user);
            let home = home.to_string_lossy();
            let args = [
                "-m",
                "-d",
                home.as_ref(),
                "-s",
                DEFAULT_SHELL,
                ctx.target_user.as_str(),
            ];
            run_command("useradd", &args).await?;
            Ok(RestoreOutcome::Created)
        })
    }

    fn remove_account<'a>(&'a self, user: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            if lookup_user(user)?.is_none() {
                return Ok(());
            }
            run_command("userdel", &["-r", user]).await
        })
    }

    fn verify_account<'a>(&'a self, user: &'a str) -> ServiceFuture<'a, AccountFacts> {
        Box::pin(async move {
            let Some(account) = lookup_user(user)? else {
                return Ok(AccountFacts {
                    exists: false,
                    home_dir: None,
                    home_exists: false,
                    ownership_ok: false,
                });
            };

            let (home_exists, ownership_ok) = match fs::metadata(&account.dir) {
                Ok(meta) => (
                    meta.is_dir(),
                    meta.uid() == account.uid.as_raw() && meta.gid() == account.gid.as_raw(),
                ),
                Err(_) => (false, false),
            };

            Ok(AccountFacts {
                exists: true,
                home_dir: Some(account.dir),
                home_exists,
                ownership_ok,
            })
        })
    }
}

/// Legacy document root relative to the legacy home (`/home/<user>/x` -> `x`).
fn docroot_relative(docroot: &str) -> Option<PathBuf> {
    let rest: PathBuf = Path::new(docroot)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .skip(2)
        .collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

fn chown_tree(path: &Path, uid: Uid, gid: Gid) -> ServiceResult<()> {
    chown(path, Some(uid), Some(gid))
        .map_err(|errno| ServiceError::io(path, errno.into()))?;
    let meta = fs::symlink_metadata(path).map_err(|e| ServiceError::io(path, e))?;
    if meta.is_dir() {
        for entry in fs::read_dir(path).map_err(|e| ServiceError::io(path, e))? {
            let entry = entry.map_err(|e| ServiceError::io(path, e))?;
            chown_tree(&entry.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Home directory content and domain document roots.
#[derive(Debug, Clone)]
pub struct HomeFilesystem {
    home_root: PathBuf,
    spool: SpoolServices,
}

impl HomeFilesystem {
    pub fn new(home_root: impl Into<PathBuf>, spool: SpoolServices) -> Self {
        Self {
            home_root: home_root.into(),
            spool,
        }
    }

    fn owner_ids(user: &str) -> ServiceResult<(Uid, Gid)> {
        lookup_user(user)?
            .map(|u| (u.uid, u.gid))
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", user)))
    }

    fn build_tree(
        &self,
        user: &str,
        mode: RestoreMode,
        domains: &[MigrationDomain],
    ) -> ServiceResult<TreeOutcome> {
        let (uid, gid) = Self::owner_ids(user)?;
        let home = self.home_root.join(user);
        let mut wanted = vec![home.clone(), home.join("public_html"), home.join("mail"), home.join("etc")];
        for domain in domains {
            if let Some(rel) = domain.document_root.as_deref().and_then(docroot_relative) {
                wanted.push(home.join(rel));
            }
        }

        let mut outcome = TreeOutcome::default();
        for dir in wanted {
            if dir.exists() {
                continue;
            }
            fs::create_dir_all(&dir).map_err(|e| ServiceError::io(&dir, e))?;
            chown(&dir, Some(uid), Some(gid)).map_err(|errno| ServiceError::io(&dir, errno.into()))?;
            outcome.directories.push(dir.to_string_lossy().into_owned());
        }

        for domain in domains {
            if self.spool.register_domain(&domain.name, user, mode)? == RestoreOutcome::Created {
                outcome.domains.push(domain.name.clone());
            }
        }
        Ok(outcome)
    }
}

impl FilesystemRestorer for HomeFilesystem {
    fn create_tree<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        domains: &'a [MigrationDomain],
    ) -> ServiceFuture<'a, TreeOutcome> {
        Box::pin(async move {
            let this = self.clone();
            let user = ctx.target_user.clone();
            let mode = ctx.mode;
            let domains = domains.to_vec();
            run_blocking(move || this.build_tree(&user, mode, &domains)).await
        })
    }

    fn restore_home<'a>(&'a self, ctx: &'a RestoreContext) -> ServiceFuture<'a, u64> {
        Box::pin(async move {
            let source = ctx.content_path("homedir")?;
            let home = self.home_root.join(&ctx.target_user);
            let user = ctx.target_user.clone();
            let replace = ctx.mode == RestoreMode::Overwrite;

            run_blocking(move || {
                if !source.is_dir() {
                    return Ok(0);
                }
                let (uid, gid) = Self::owner_ids(&user)?;
                let bytes = copy_tree(&source, &home, replace).map_err(|e| ServiceError::io(&home, e))?;
                chown_tree(&home, uid, gid)?;
                Ok(bytes)
            })
            .await
        })
    }

    fn remove_tree<'a>(
        &'a self,
        user: &'a str,
        directories: &'a [String],
        domains: &'a [String],
    ) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let spool = self.spool.clone();
            let mut directories = directories.to_vec();
            let domains = domains.to_vec();
            let user = user.to_string();

            run_blocking(move || {
                // deepest first
                directories.sort_by_key(|d| std::cmp::Reverse(d.len()));
                for dir in &directories {
                    match fs::remove_dir_all(dir) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(ServiceError::io(dir, e)),
                    }
                }
                for domain in &domains {
                    spool.unregister_domain(domain)?;
                }
                Logger::info(
                    "HOME_TREE_REMOVED",
                    &[
                        ("directories", &directories.len().to_string()),
                        ("user", &user),
                    ],
                );
                Ok(())
            })
            .await
        })
    }
}

/// `systemctl is-active --quiet <service>` for each required service.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemctlProbe;

impl ServiceProbe for SystemctlProbe {
    fn missing_services<'a>(&'a self, required: &'a [String]) -> ServiceFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut missing = Vec::new();
            for service in required {
                let active = Command::new("systemctl")
                    .args(["is-active", "--quiet", service.as_str()])
                    .status()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false);
                if !active {
                    missing.push(service.clone());
                }
            }
            Ok(missing)
        })
    }
}

/// Inventory backed by the passwd database and the spool registry.
#[derive(Debug, Clone)]
pub struct HostInventory {
    spool: SpoolServices,
}

impl HostInventory {
    pub fn new(spool: SpoolServices) -> Self {
        Self { spool }
    }
}

impl TargetInventory for HostInventory {
    fn user_exists(&self, user: &str) -> ServiceResult<bool> {
        Ok(lookup_user(user)?.is_some())
    }

    fn domain_owner(&self, domain: &str) -> ServiceResult<Option<String>> {
        Ok(self.spool.registry()?.domains.get(domain).cloned())
    }

    fn database_owner(&self, database: &str) -> ServiceResult<Option<String>> {
        Ok(self.spool.registry()?.databases.get(database).cloned())
    }

    fn mailbox_exists(&self, address: &str) -> ServiceResult<bool> {
        Ok(self.spool.registry()?.mailboxes.contains_key(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docroot_relative() {
        assert_eq!(
            docroot_relative("/home/olduser/public_html/shop"),
            Some(PathBuf::from("public_html/shop"))
        );
        assert_eq!(docroot_relative("/home/olduser"), None);
    }

    #[test]
    fn test_root_account_is_found() {
        assert!(lookup_user("root").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_probe_reports_unknown_service_missing() {
        let required = vec!["migrad-test-no-such-service".to_string()];
        let missing = SystemctlProbe.missing_services(&required).await.unwrap();
        assert_eq!(missing, required);
    }

    #[tokio::test]
    async fn test_inventory_reads_spool_registry() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolServices::open(dir.path()).unwrap();
        spool
            .register_domain("example.com", "bob", RestoreMode::Merge)
            .unwrap();

        let inventory = HostInventory::new(spool);
        assert_eq!(
            inventory.domain_owner("example.com").unwrap().as_deref(),
            Some("bob")
        );
        assert!(!inventory.mailbox_exists("x@example.com").unwrap());
    }
}
