//! Spool hand-off to platform services
//!
//! Database, mailbox, DNS and certificate restores are requests to services
//! that run outside this agent. Each request is a directory under
//! `<spool>/<service>/<request-id>/` holding a copy of the payload and a
//! `request.json`, written atomically. The services consume the spool.
//!
//! `registry.json` tracks which account owns each restored item and doubles
//! as the inventory for conflict detection.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    copy_tree, run_blocking, upsert_owned, CertificateRestorer, DatabaseRestorer, DnsRestorer,
    MailboxRestorer, RestoreContext, RestoreOutcome, ServiceError, ServiceFuture, ServiceResult,
};
use crate::observability::Logger;
use crate::plan::{
    DatabaseType, MigrationDatabase, MigrationDnsZone, MigrationEmail, MigrationSsl, RestoreMode,
};

const REGISTRY_FILE: &str = "registry.json";
const REQUEST_FILE: &str = "request.json";

/// Ownership records for everything restored through the spool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub domains: BTreeMap<String, String>,
    #[serde(default)]
    pub databases: BTreeMap<String, String>,
    #[serde(default)]
    pub mailboxes: BTreeMap<String, String>,
    #[serde(default)]
    pub zones: BTreeMap<String, String>,
    #[serde(default)]
    pub certificates: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct SpoolRequest<'a, T: Serialize> {
    id: Uuid,
    service: &'a str,
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<RestoreMode>,
    submitted_at: DateTime<Utc>,
    /// Payload file names inside the request directory
    payload: Vec<String>,
    item: T,
}

#[derive(Debug, Serialize)]
struct DatabaseItem {
    source_name: String,
    target_name: String,
    db_type: DatabaseType,
    target_db_user: Option<String>,
}

#[derive(Debug, Serialize)]
struct NameItem<'a> {
    name: &'a str,
}

/// Spool-backed restorer for the platform services. Clones share the registry lock.
#[derive(Debug, Clone)]
pub struct SpoolServices {
    root: PathBuf,
    registry_lock: Arc<Mutex<()>>,
}

impl SpoolServices {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;
        Ok(Self {
            root,
            registry_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the registry.
    pub fn registry(&self) -> ServiceResult<Registry> {
        let _guard = self
            .registry_lock
            .lock()
            .map_err(|_| ServiceError::failed("spool registry", "lock poisoned"))?;
        self.load_registry()
    }

    /// Read-modify-write the registry under the lock.
    pub(crate) fn update_registry<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let _guard = self
            .registry_lock
            .lock()
            .map_err(|_| ServiceError::failed("spool registry", "lock poisoned"))?;
        let mut registry = self.load_registry()?;
        let value = f(&mut registry)?;
        let path = self.root.join(REGISTRY_FILE);
        let json = serde_json::to_vec_pretty(&registry)
            .map_err(|e| ServiceError::failed("spool registry", e.to_string()))?;
        write_atomic(&path, &json).map_err(|e| ServiceError::io(&path, e))?;
        Ok(value)
    }

    fn load_registry(&self) -> ServiceResult<Registry> {
        let path = self.root.join(REGISTRY_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ServiceError::failed("spool registry", e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Registry::default()),
            Err(e) => Err(ServiceError::io(&path, e)),
        }
    }

    /// Write one request directory. Payload files are copied in first so the
    /// request only becomes visible once complete.
    fn submit<T: Serialize>(
        &self,
        service: &str,
        action: &str,
        ctx: Option<&RestoreContext>,
        payload: &[PathBuf],
        item: T,
    ) -> ServiceResult<Uuid> {
        let id = Uuid::new_v4();
        let dir = self.root.join(service).join(id.to_string());
        fs::create_dir_all(&dir).map_err(|e| ServiceError::io(&dir, e))?;

        let mut names = Vec::new();
        for source in payload {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ServiceError::NotFound(source.display().to_string()))?;
            if !source.exists() {
                return Err(ServiceError::NotFound(source.display().to_string()));
            }
            copy_tree(source, &dir.join(&name), true).map_err(|e| ServiceError::io(source, e))?;
            names.push(name);
        }

        let request = SpoolRequest {
            id,
            service,
            action,
            job_id: ctx.map(|c| c.job_id),
            target_user: ctx.map(|c| c.target_user.as_str()),
            mode: ctx.map(|c| c.mode),
            submitted_at: Utc::now(),
            payload: names,
            item,
        };
        let json = serde_json::to_vec_pretty(&request)
            .map_err(|e| ServiceError::failed("spool request", e.to_string()))?;
        let path = dir.join(REQUEST_FILE);
        write_atomic(&path, &json).map_err(|e| ServiceError::io(&path, e))?;

        Logger::info(
            "SPOOL_REQUEST_WRITTEN",
            &[
                ("action", action),
                ("request_id", &id.to_string()),
                ("service", service),
            ],
        );
        Ok(id)
    }

    /// Register ownership, then hand off unless the item was kept as-is.
    fn restore_item<T: Serialize>(
        &self,
        service: &str,
        ctx: &RestoreContext,
        key: &str,
        table: Table,
        payload: &[PathBuf],
        item: T,
    ) -> ServiceResult<RestoreOutcome> {
        let outcome = self.update_registry(|r| upsert_owned(table(r), key, &ctx.target_user, ctx.mode))?;
        if outcome != RestoreOutcome::Merged {
            self.submit(service, "restore", Some(ctx), payload, item)?;
        }
        Ok(outcome)
    }

    fn remove_item(
        &self,
        service: &str,
        key: &str,
        table: Table,
    ) -> ServiceResult<()> {
        self.update_registry(|r| {
            table(r).remove(key);
            Ok(())
        })?;
        self.submit(service, "remove", None, &[], NameItem { name: key })?;
        Ok(())
    }

    pub(crate) fn register_domain(&self, domain: &str, owner: &str, mode: RestoreMode) -> ServiceResult<RestoreOutcome> {
        self.update_registry(|r| upsert_owned(&mut r.domains, domain, owner, mode))
    }

    pub(crate) fn unregister_domain(&self, domain: &str) -> ServiceResult<()> {
        self.update_registry(|r| {
            r.domains.remove(domain);
            Ok(())
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

type Table = fn(&mut Registry) -> &mut BTreeMap<String, String>;

impl SpoolServices {
    async fn restore_blocking<T: Serialize + Send + 'static>(
        &self,
        service: &'static str,
        ctx: &RestoreContext,
        key: &str,
        table: Table,
        payload: Vec<PathBuf>,
        item: T,
    ) -> ServiceResult<RestoreOutcome> {
        let this = self.clone();
        let ctx = ctx.clone();
        let key = key.to_string();
        run_blocking(move || this.restore_item(service, &ctx, &key, table, &payload, item)).await
    }

    async fn remove_blocking(&self, service: &'static str, key: &str, table: Table) -> ServiceResult<()> {
        let this = self.clone();
        let key = key.to_string();
        run_blocking(move || this.remove_item(service, &key, table)).await
    }
}

impl DatabaseRestorer for SpoolServices {
    fn restore_database<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        database: &'a MigrationDatabase,
        target_name: &'a str,
        target_db_user: Option<&'a str>,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            let item = DatabaseItem {
                source_name: database.name.clone(),
                target_name: target_name.to_string(),
                db_type: database.db_type,
                target_db_user: target_db_user.map(str::to_string),
            };
            let payload = vec![ctx.content_path(&database.dump_file)?];
            self.restore_blocking("databases", ctx, target_name, |r| &mut r.databases, payload, item)
                .await
        })
    }

    fn drop_database<'a>(&'a self, name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(self.remove_blocking("databases", name, |r| &mut r.databases))
    }
}

impl MailboxRestorer for SpoolServices {
    fn restore_mailbox<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        mailbox: &'a MigrationEmail,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            let payload = mailbox
                .maildir
                .iter()
                .map(|m| ctx.content_path(m))
                .collect::<ServiceResult<Vec<_>>>()?;
            self.restore_blocking(
                "mailboxes",
                ctx,
                &mailbox.address,
                |r| &mut r.mailboxes,
                payload,
                mailbox.clone(),
            )
            .await
        })
    }

    fn remove_mailbox<'a>(&'a self, address: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(self.remove_blocking("mailboxes", address, |r| &mut r.mailboxes))
    }
}

impl DnsRestorer for SpoolServices {
    fn restore_zone<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        zone: &'a MigrationDnsZone,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            let payload = vec![ctx.content_path(&zone.zone_file)?];
            self.restore_blocking("dns", ctx, &zone.zone_name, |r| &mut r.zones, payload, zone.clone())
                .await
        })
    }

    fn remove_zone<'a>(&'a self, zone_name: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(self.remove_blocking("dns", zone_name, |r| &mut r.zones))
    }
}

impl CertificateRestorer for SpoolServices {
    fn install_certificate<'a>(
        &'a self,
        ctx: &'a RestoreContext,
        certificate: &'a MigrationSsl,
    ) -> ServiceFuture<'a, RestoreOutcome> {
        Box::pin(async move {
            let key = certificate.private_key_file.as_deref().ok_or_else(|| {
                ServiceError::NotFound(format!("private key for {}", certificate.domain))
            })?;
            let payload = vec![
                ctx.content_path(&certificate.certificate_file)?,
                ctx.content_path(key)?,
            ];
            self.restore_blocking(
                "ssl",
                ctx,
                &certificate.domain,
                |r| &mut r.certificates,
                payload,
                certificate.clone(),
            )
            .await
        })
    }

    fn remove_certificate<'a>(&'a self, domain: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(self.remove_blocking("ssl", domain, |r| &mut r.certificates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(content: &Path, mode: RestoreMode) -> RestoreContext {
        RestoreContext {
            job_id: Uuid::new_v4(),
            target_user: "alice".to_string(),
            content_root: content.to_path_buf(),
            mode,
        }
    }

    fn zone() -> MigrationDnsZone {
        MigrationDnsZone {
            zone_name: "example.com".to_string(),
            record_count: 2,
            serial_number: Some(1),
            zone_file: "dnszones/example.com.db".to_string(),
        }
    }

    #[tokio::test]
    async fn test_zone_request_written_with_payload() {
        let spool_dir = TempDir::new().unwrap();
        let content = TempDir::new().unwrap();
        fs::create_dir_all(content.path().join("dnszones")).unwrap();
        fs::write(content.path().join("dnszones/example.com.db"), "@ IN A 192.0.2.1\n").unwrap();

        let spool = SpoolServices::open(spool_dir.path()).unwrap();
        let outcome = spool
            .restore_zone(&ctx(content.path(), RestoreMode::Merge), &zone())
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::Created);

        let requests: Vec<_> = fs::read_dir(spool_dir.path().join("dns"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].join("example.com.db").is_file());

        let request: serde_json::Value =
            serde_json::from_slice(&fs::read(requests[0].join(REQUEST_FILE)).unwrap()).unwrap();
        assert_eq!(request["action"], "restore");
        assert_eq!(request["target_user"], "alice");
        assert_eq!(request["item"]["zone_name"], "example.com");

        assert_eq!(
            spool.registry().unwrap().zones.get("example.com").map(String::as_str),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn test_merge_of_existing_item_writes_nothing() {
        let spool_dir = TempDir::new().unwrap();
        let content = TempDir::new().unwrap();
        fs::create_dir_all(content.path().join("dnszones")).unwrap();
        fs::write(content.path().join("dnszones/example.com.db"), "x").unwrap();

        let spool = SpoolServices::open(spool_dir.path()).unwrap();
        let c = ctx(content.path(), RestoreMode::Merge);
        spool.restore_zone(&c, &zone()).await.unwrap();
        let again = spool.restore_zone(&c, &zone()).await.unwrap();
        assert_eq!(again, RestoreOutcome::Merged);
        assert_eq!(fs::read_dir(spool_dir.path().join("dns")).unwrap().count(), 1);

        spool.remove_zone("example.com").await.unwrap();
        assert!(spool.registry().unwrap().zones.is_empty());
    }

    #[tokio::test]
    async fn test_mailbox_outside_backup_root_is_refused() {
        let spool_dir = TempDir::new().unwrap();
        let content = TempDir::new().unwrap();
        let spool = SpoolServices::open(spool_dir.path()).unwrap();
        let mailbox = MigrationEmail {
            address: "x@example.com".to_string(),
            domain: "example.com".to_string(),
            local_part: "x".to_string(),
            has_mailbox: true,
            maildir_size: 0,
            maildir: Some("homedir/mail/example.com/../../../../etc".to_string()),
            forwarding: Vec::new(),
            mailing_lists: Vec::new(),
        };

        let err = spool
            .restore_mailbox(&ctx(content.path(), RestoreMode::Merge), &mailbox)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the backup root"));
        assert!(spool.registry().unwrap().mailboxes.is_empty());
    }
}
