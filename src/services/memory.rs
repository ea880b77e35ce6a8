//! In-memory target host
//!
//! Implements every collaborator against one lock-protected table. Used by
//! tests and by `migrad inspect` previews. Supports:
//! - failure injection per operation name (`fail_on`)
//! - a gate that parks `create_account` until released (`hold_identity`)
//! - a call log for asserting which steps touched the target

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;

use super::{
    AccountFacts, CertificateRestorer, DatabaseRestorer, DnsRestorer, FilesystemRestorer,
    IdentityProvisioner, MailboxRestorer, RestoreContext, RestoreOutcome, ServiceError,
    ServiceFuture, ServiceProbe, ServiceResult, TargetInventory, TreeOutcome,
    upsert_owned,
};
use crate::plan::{
    tree_size, MigrationDatabase, MigrationDnsZone, MigrationDomain, MigrationEmail,
    MigrationSsl,
};

#[derive(Debug, Default)]
struct HostState {
    users: BTreeSet<String>,
    directories: BTreeSet<String>,
    home_bytes: BTreeMap<String, u64>,
    /// name -> owner
    domains: BTreeMap<String, String>,
    databases: BTreeMap<String, String>,
    mailboxes: BTreeMap<String, String>,
    zones: BTreeMap<String, String>,
    certificates: BTreeMap<String, String>,
    broken_ownership: BTreeSet<String>,
    missing_services: Vec<String>,
    failures: HashMap<String, String>,
    calls: Vec<String>,
}

/// Simulated target host.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    state: Mutex<HostState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

fn poisoned() -> ServiceError {
    ServiceError::failed("in-memory host", "state lock poisoned")
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> ServiceResult<MutexGuard<'_, HostState>> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Record the call and return the injected failure for it, if any.
    fn enter(&self, op: &str, subject: &str) -> ServiceResult<MutexGuard<'_, HostState>> {
        let mut state = self.state()?;
        state.calls.push(format!("{}:{}", op, subject));
        if let Some(detail) = state.failures.get(op) {
            return Err(ServiceError::failed(op, detail.clone()));
        }
        Ok(state)
    }

    /// Make every call to `op` fail with `detail`.
    pub fn fail_on(&self, op: &str, detail: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(op.to_string(), detail.to_string());
        }
    }

    pub fn clear_failure(&self, op: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.remove(op);
        }
    }

    /// Park every `create_account` call until `release_identity`.
    pub fn hold_identity(&self) {
        if let Ok(mut gate) = self.gate.lock() {
            *gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    pub fn release_identity(&self) {
        if let Ok(mut gate) = self.gate.lock() {
            if let Some(sem) = gate.take() {
                sem.close();
            }
        }
    }

    fn current_gate(&self) -> Option<Arc<Semaphore>> {
        self.gate.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_missing_services(&self, missing: &[&str]) {
        if let Ok(mut state) = self.state.lock() {
            state.missing_services = missing.iter().map(|s| s.to_string()).collect();
        }
    }

    pub fn break_ownership(&self, user: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.broken_ownership.insert(user.to_string());
        }
    }

    pub fn add_user(&self, user: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.users.insert(user.to_string());
            state.directories.insert(home_of(user));
        }
    }

    pub fn add_domain(&self, domain: &str, owner: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.domains.insert(domain.to_string(), owner.to_string());
        }
    }

    pub fn add_database(&self, name: &str, owner: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.databases.insert(name.to_string(), owner.to_string());
        }
    }

    pub fn add_mailbox(&self, address: &str, owner: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.mailboxes.insert(address.to_string(), owner.to_string());
        }
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.read(|s| s.users.contains(user))
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.read(|s| s.directories.contains(path))
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.read(|s| s.domains.contains_key(domain))
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.read(|s| s.databases.contains_key(name))
    }

    pub fn has_mailbox(&self, address: &str) -> bool {
        self.read(|s| s.mailboxes.contains_key(address))
    }

    pub fn has_zone(&self, zone: &str) -> bool {
        self.read(|s| s.zones.contains_key(zone))
    }

    pub fn has_certificate(&self, domain: &str) -> bool {
        self.read(|s| s.certificates.contains_key(domain))
    }

    pub fn home_bytes(&self, user: &str) -> u64 {
        self.read(|s| s.home_bytes.get(user).copied().unwrap_or(0))
    }

    /// Every call as `operation:subject`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.read(|s| s.calls.clone())
    }

    /// Calls for one operation name.
    pub fn calls_to(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}:", op);
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }

    fn read<T: Default>(&self, f: impl FnOnce(&HostState) -> T) -> T {
        self.state.lock().map(|s| f(&s)).unwrap_or_default()
    }
}

fn home_of(user: &str) -> String {
    format!("/home/{}", user)
}

impl IdentityProvisioner for InMemoryHost {
    fn create_account<'a>(&'a self, ctx: &'a RestoreContext) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            if let Some(gate) = self.current_gate() {
                // closed gate means released
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            let mut state = self.enter("create_account", &ctx.target_user)?;
            if state.users.insert(ctx.target_user.clone()) {
                Ok(RestoreOutcome::Created)
            } else {
                Ok(RestoreOutcome::Merged)
            }
        })
    }

    fn remove_account<'a>(&'a self, user: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.enter("remove_account", user)?;
            state.users.remove(user);
            state.home_bytes.remove(user);
            let home = home_of(user);
            state.directories.retain(|d| !d.starts_with(&home));
            Ok(())
        })
    }

    fn verify_account<'a>(&'a self, user: &'a str) -> ServiceFuture<'a, AccountFacts> {
        Box::pin(async move {
            let state = self.enter("verify_account", user)?;
            let home = home_of(user);
            Ok(AccountFacts {
                exists: state.users.contains(user),
                home_exists: state.directories.contains(&home),
                home_dir: Some(PathBuf::from(home)),
                ownership_ok: !state.broken_ownership.contains(user),
            })
        })
    }
}

impl FilesystemRestorer for InMemoryHost {
    fn create_tree<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        domains: &'a [MigrationDomain],
    ) -> ServiceFuture<'a, TreeOutcome> {
        Box::pin(async move {
            let mut state = self.enter("create_tree", &ctx.target_user)?;
            let home = home_of(&ctx.target_user);
            let mut outcome = TreeOutcome::default();

            for dir in [home.clone(), format!("{}/public_html", home), format!("{}/mail", home)] {
                if state.directories.insert(dir.clone()) {
                    outcome.directories.push(dir);
                }
            }
            for domain in domains {
                match upsert_owned(&mut state.domains, &domain.name, &ctx.target_user, ctx.mode)? {
                    RestoreOutcome::Created => outcome.domains.push(domain.name.clone()),
                    RestoreOutcome::Replaced | RestoreOutcome::Merged => {}
                }
            }
            Ok(outcome)
        })
    }

    fn restore_home<'a>(&'a self, ctx: &'a RestoreContext) -> ServiceFuture<'a, u64> {
        Box::pin(async move {
            let homedir = ctx.content_path("homedir")?;
            let bytes = if homedir.is_dir() {
                tree_size(&homedir).map_err(|e| ServiceError::io(&homedir, e))?
            } else {
                0
            };
            let mut state = self.enter("restore_home", &ctx.target_user)?;
            state.home_bytes.insert(ctx.target_user.clone(), bytes);
            Ok(bytes)
        })
    }

    fn remove_tree<'a>(
        &'a self,
        user: &'a str,
        directories: &'a [String],
        domains: &'a [String],
    ) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.enter("remove_tree", user)?;
            for dir in directories {
                state.directories.remove(dir);
            }
            for domain in domains {
                state.domains.remove(domain);
            }
            Ok(())
        })
    }
}

impl DatabaseRestorer for InMemoryHost {
    fn restore_database<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        database: &'a MigrationDatabase,
        target_name: &'a str,
        _target_db_user: Option<&'a str>,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            let dump = ctx.content_path(&database.dump_file)?;
            if !dump.is_file() {
                return Err(ServiceError::NotFound(database.dump_file.clone()));
            }
            let mut state = self.enter("restore_database", target_name)?;
            upsert_owned(&mut state.databases, target_name, &ctx.target_user, ctx.mode)
        })
    }

    fn drop_database<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.enter("drop_database", name)?;
            state.databases.remove(name);
            Ok(())
        })
    }
}

impl MailboxRestorer for InMemoryHost {
    fn restore_mailbox<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        mailbox: &'a MigrationEmail,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            for maildir in &mailbox.maildir {
                ctx.content_path(maildir)?;
            }
            let mut state = self.enter("restore_mailbox", &mailbox.address)?;
            upsert_owned(&mut state.mailboxes, &mailbox.address, &ctx.target_user, ctx.mode)
        })
    }

    fn remove_mailbox<'a>(&'a self, address: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.enter("remove_mailbox", address)?;
            state.mailboxes.remove(address);
            Ok(())
        })
    }
}

impl DnsRestorer for InMemoryHost {
    fn restore_zone<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        zone: &'a MigrationDnsZone,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            let mut state = self.enter("restore_zone", &zone.zone_name)?;
            upsert_owned(&mut state.zones, &zone.zone_name, &ctx.target_user, ctx.mode)
        })
    }

    fn remove_zone<'a>(&'a self, zone_name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.enter("remove_zone", zone_name)?;
            state.zones.remove(zone_name);
            Ok(())
        })
    }
}

impl CertificateRestorer for InMemoryHost {
    fn install_certificate<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        certificate: &'a MigrationSsl,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            let mut state = self.enter("install_certificate", &certificate.domain)?;
            upsert_owned(
                &mut state.certificates,
                &certificate.domain,
                &ctx.target_user,
                ctx.mode,
            )
        })
    }

    fn remove_certificate<'a>(&'a self, domain: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.enter("remove_certificate", domain)?;
            state.certificates.remove(domain);
            Ok(())
        })
    }
}

impl TargetInventory for InMemoryHost {
    fn user_exists(&self, user: &str) -> ServiceResult<bool> {
        Ok(self.state()?.users.contains(user))
    }

    fn domain_owner(&self, domain: &str) -> ServiceResult<Option<String>> {
        Ok(self.state()?.domains.get(domain).cloned())
    }

    fn database_owner(&self, database: &str) -> ServiceResult<Option<String>> {
        Ok(self.state()?.databases.get(database).cloned())
    }

    fn mailbox_exists(&self, address: &str) -> ServiceResult<bool> {
        Ok(self.state()?.mailboxes.contains_key(address))
    }
}

impl ServiceProbe for InMemoryHost {
    fn missing_services<'a>(&'a self, required: &'a [String]) -> ServiceFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.state()?;
            Ok(required
                .iter()
                .filter(|s| state.missing_services.contains(s))
                .cloned()
                .collect())
        })
    }
}
