//! Shared fixtures for agent integration tests.

#![allow(dead_code)]

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use migrad::agent::{MigrationAgent, Response};
use migrad::config::MigrationConfig;
use migrad::engine::EngineContext;
use migrad::observability::MemoryAuditLog;
use migrad::services::memory::InMemoryHost;
use serde_json::{json, Value};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

// =============================================================================
// Backup archives
// =============================================================================

/// Files of a small but complete `cpmove-olduser` account backup.
pub fn account_files() -> Vec<(&'static str, &'static str)> {
    vec![
        ("cp/olduser", "USER=olduser\nDNS=example.com\nPLAN=default\n"),
        ("version", "archive version: 4\n"),
        (
            "userdata/main",
            "---\naddon_domains: {}\nmain_domain: example.com\nparked_domains: []\nsub_domains:\n  - blog.example.com\n",
        ),
        ("userdata/example.com", "documentroot: /home/olduser/public_html\n"),
        ("homedir/public_html/index.html", "<h1>hello</h1>"),
        (
            "homedir/etc/example.com/passwd",
            "info:x:1000:1000::/home/olduser/mail/example.com/info:/bin/false\n",
        ),
        ("homedir/mail/example.com/info/cur/1", "Subject: hi\n\nbody\n"),
        ("mysql/olduser_wp.sql", "CREATE TABLE `wp_posts` (\n);\n"),
        (
            "mysql.sql",
            "GRANT ALL PRIVILEGES ON `olduser\\_wp`.* TO 'olduser_wpu'@'localhost';\n",
        ),
        (
            "dnszones/example.com.db",
            "$TTL 14400\nexample.com. 86400 IN SOA ns1.host.test. admin.example.com. (\n  2024010101 ; serial\n  3600 )\nwww IN A 192.0.2.10\n",
        ),
        ("sslcerts/example.com_abc_123.crt", "CERT"),
        ("sslkeys/example.com_abc_123.key", "KEY"),
    ]
}

fn append_file<W: std::io::Write>(builder: &mut Builder<W>, path: &str, body: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();
    builder.append_data(&mut header, path, body).unwrap();
}

/// Write a raw name into the header so `..` survives the builder's checks.
fn append_raw<W: std::io::Write>(builder: &mut Builder<W>, raw_name: &str, body: &[u8]) {
    let mut header = Header::new_old();
    {
        let name = &mut header.as_old_mut().name;
        name[..raw_name.len()].copy_from_slice(raw_name.as_bytes());
    }
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();
    builder.append(&header, body).unwrap();
}

/// `<dir>/cpmove-olduser.tar.gz` holding `files` under `cpmove-olduser/`,
/// plus any `raw` entries written verbatim.
pub fn write_backup_with(
    dir: &Path,
    files: &[(&str, &str)],
    raw: &[(&str, &str)],
) -> PathBuf {
    let path = dir.join("cpmove-olduser.tar.gz");
    let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    let mut builder = Builder::new(encoder);
    for (rel, body) in files {
        append_file(&mut builder, &format!("cpmove-olduser/{}", rel), body.as_bytes());
    }
    for (name, body) in raw {
        append_raw(&mut builder, name, body.as_bytes());
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
}

pub fn write_backup(dir: &Path) -> PathBuf {
    write_backup_with(dir, &account_files(), &[])
}

// =============================================================================
// Agent harness
// =============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub host: Arc<InMemoryHost>,
    pub audit: Arc<MemoryAuditLog>,
    pub agent: MigrationAgent,
    pub backup: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {}, u64::MAX)
    }

    /// Harness with a tweaked config and a fixed free-space figure.
    pub fn with(tweak: impl FnOnce(&mut MigrationConfig), available_bytes: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = MigrationConfig::rooted_at(dir.path());
        tweak(&mut config);
        fs::create_dir_all(&config.home_root).unwrap();

        let host = Arc::new(InMemoryHost::new());
        let ctx = EngineContext::in_memory(config, host.clone(), available_bytes).unwrap();
        let audit = Arc::new(MemoryAuditLog::new());
        let agent = MigrationAgent::new(ctx, audit.clone());
        let backup = write_backup(dir.path());

        Self {
            dir,
            host,
            audit,
            agent,
            backup,
        }
    }

    pub async fn call(&self, request: Value) -> Response {
        self.agent.handle_value(request).await
    }

    /// Call and return the body, panicking on an error response.
    pub async fn ok(&self, request: Value) -> Value {
        let resp = self.call(request).await;
        assert!(resp.is_success(), "request failed: {}", resp.to_json());
        resp.to_value()
    }

    pub async fn status(&self, job_id: &str) -> Value {
        self.ok(json!({"action": "migration_job_status", "job_id": job_id}))
            .await
    }

    /// Poll until the job reports one of `statuses`.
    pub async fn wait_for(&self, job_id: &str, statuses: &[&str]) -> Value {
        for _ in 0..500 {
            let body = self.status(job_id).await;
            let status = body["status"].as_str().unwrap_or_default().to_string();
            if statuses.contains(&status.as_str()) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}", job_id, statuses);
    }

    /// Analyze the fixture backup for `target_user`; returns the job id once planned.
    pub async fn analyzed(&self, target_user: &str) -> String {
        let body = self
            .ok(json!({
                "action": "migration_analyze_backup",
                "operator": "admin",
                "backup_path": self.backup,
                "target_user": target_user,
            }))
            .await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        self.agent.wait_for_analyses().await;
        let status = self.wait_for(&job_id, &["planning", "failed"]).await;
        assert_eq!(status["status"], json!("planning"), "analysis failed: {}", status);
        job_id
    }

    /// Preview the job and return its approval token.
    pub async fn approval_token(&self, job_id: &str) -> String {
        let body = self
            .ok(json!({"action": "migration_preview", "job_id": job_id}))
            .await;
        body["approval_token"].as_str().unwrap().to_string()
    }

    /// Analyze, preview and queue an apply.
    pub async fn applied(&self, target_user: &str) -> String {
        let job_id = self.analyzed(target_user).await;
        let token = self.approval_token(&job_id).await;
        self.ok(json!({
            "action": "migration_apply",
            "job_id": job_id,
            "approval_token": token,
        }))
        .await;
        job_id
    }
}
