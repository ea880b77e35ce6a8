//! Migration plan value types

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conflicts::Conflict;

/// Restorable component classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentClass {
    Files,
    Databases,
    Email,
    Dns,
    Ssl,
}

impl ComponentClass {
    pub const ALL: [ComponentClass; 5] = [
        ComponentClass::Files,
        ComponentClass::Databases,
        ComponentClass::Email,
        ComponentClass::Dns,
        ComponentClass::Ssl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentClass::Files => "files",
            ComponentClass::Databases => "databases",
            ComponentClass::Email => "email",
            ComponentClass::Dns => "dns",
            ComponentClass::Ssl => "ssl",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ComponentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selected component classes of a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentSet(BTreeSet<ComponentClass>);

impl ComponentSet {
    /// All five classes, as used by a full migration.
    pub fn all() -> Self {
        Self(ComponentClass::ALL.into_iter().collect())
    }

    pub fn contains(&self, class: ComponentClass) -> bool {
        self.0.contains(&class)
    }

    pub fn insert(&mut self, class: ComponentClass) {
        self.0.insert(class);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.0.len() == ComponentClass::ALL.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ComponentClass> + '_ {
        self.0.iter().copied()
    }

    /// Classes not in the set.
    pub fn excluded(&self) -> Vec<ComponentClass> {
        ComponentClass::ALL
            .into_iter()
            .filter(|c| !self.contains(*c))
            .collect()
    }
}

impl FromIterator<ComponentClass> for ComponentSet {
    fn from_iter<I: IntoIterator<Item = ComponentClass>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How restored data meets existing target data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Add what is missing, never replace
    #[default]
    Merge,
    /// Replace existing target data
    Overwrite,
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::Merge => "merge",
            RestoreMode::Overwrite => "overwrite",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Main,
    Addon,
    Parked,
    Sub,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDomain {
    pub name: String,
    pub kind: DomainKind,
    pub is_addon: bool,
    /// Document root as recorded by the legacy panel
    pub document_root: Option<String>,
    pub size: u64,
    pub ssl: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEmail {
    pub address: String,
    pub domain: String,
    pub local_part: String,
    pub has_mailbox: bool,
    pub maildir_size: u64,
    /// Maildir path relative to the backup root
    pub maildir: Option<String>,
    pub forwarding: Vec<String>,
    pub mailing_lists: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Mysql,
    Postgresql,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDatabase {
    pub name: String,
    pub db_type: DatabaseType,
    pub db_user: Option<String>,
    pub size: u64,
    pub table_count: usize,
    pub owner: String,
    /// Dump path relative to the backup root
    pub dump_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDnsZone {
    pub zone_name: String,
    pub record_count: usize,
    pub serial_number: Option<u64>,
    pub zone_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSsl {
    pub domain: String,
    pub certificate_file: String,
    pub private_key_file: Option<String>,
    pub has_private_key: bool,
}

/// Structured description of what a backup contains and what restoring it creates.
///
/// Attached to a job once and never mutated afterwards; the job stores it as
/// an opaque JSON blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub target_user: String,
    pub source_user: String,
    pub backup_format: String,
    pub backup_version: Option<String>,
    pub backup_date: Option<DateTime<Utc>>,
    pub total_size: u64,

    pub domains: Vec<MigrationDomain>,
    pub email_accounts: Vec<MigrationEmail>,
    pub databases: Vec<MigrationDatabase>,
    pub dns_zones: Vec<MigrationDnsZone>,
    pub ssl_certificates: Vec<MigrationSsl>,

    pub warnings: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub skip_reasons: Vec<String>,
}

/// Counts surfaced alongside a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub domains: usize,
    pub email_accounts: usize,
    pub databases: usize,
    pub dns_zones: usize,
    pub ssl_certificates: usize,
    pub warnings: usize,
    pub conflicts: usize,
    pub total_size: u64,
}

impl MigrationPlan {
    pub fn new(target_user: impl Into<String>, source_user: impl Into<String>) -> Self {
        Self {
            target_user: target_user.into(),
            source_user: source_user.into(),
            backup_format: "unknown".to_string(),
            backup_version: None,
            backup_date: None,
            total_size: 0,
            domains: Vec::new(),
            email_accounts: Vec::new(),
            databases: Vec::new(),
            dns_zones: Vec::new(),
            ssl_certificates: Vec::new(),
            warnings: Vec::new(),
            conflicts: Vec::new(),
            skip_reasons: Vec::new(),
        }
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            domains: self.domains.len(),
            email_accounts: self.email_accounts.len(),
            databases: self.databases.len(),
            dns_zones: self.dns_zones.len(),
            ssl_certificates: self.ssl_certificates.len(),
            warnings: self.warnings.len(),
            conflicts: self.conflicts.len(),
            total_size: self.total_size,
        }
    }

    /// Certificates that can actually be installed.
    pub fn installable_certificates(&self) -> impl Iterator<Item = &MigrationSsl> {
        self.ssl_certificates.iter().filter(|c| c.has_private_key)
    }

    pub fn to_blob(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_blob(blob: &str) -> serde_json::Result<Self> {
        serde_json::from_str(blob)
    }
}
