//! Agent configuration
//!
//! JSON file, every field optional. Missing fields take the defaults below;
//! the result is validated before the agent starts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed config {}: {detail}", .path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "MIGRATE_CONFIG_IO",
            ConfigError::Parse { .. } => "MIGRATE_CONFIG_PARSE",
            ConfigError::Invalid(_) => "MIGRATE_CONFIG_INVALID",
        }
    }
}

/// Migration agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// IPC socket (default: /run/migrad/agent.sock)
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Job records and job logs (default: /var/lib/migrad)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Parent of per-job extraction directories (default: /var/lib/migrad/scratch)
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Account homes; also the root checked for free space (default: /home)
    #[serde(default = "default_home_root")]
    pub home_root: PathBuf,

    /// Hand-off directory for platform services (default: /var/spool/migrad)
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,

    /// Largest accepted backup (default: 500 GiB)
    #[serde(default = "default_max_backup_size_bytes")]
    pub max_backup_size_bytes: u64,

    #[serde(default = "default_max_concurrent_applies")]
    pub max_concurrent_applies: usize,

    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,

    #[serde(default = "default_confirmation_ttl_secs")]
    pub confirmation_ttl_secs: u64,

    /// Services that must be running before a restore
    #[serde(default = "default_required_services")]
    pub required_services: Vec<String>,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/migrad/agent.sock")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/migrad")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/lib/migrad/scratch")
}

fn default_home_root() -> PathBuf {
    PathBuf::from("/home")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/migrad")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("/var/log/migrad/audit.log")
}

fn default_max_backup_size_bytes() -> u64 {
    500 * 1024 * 1024 * 1024
}

fn default_max_concurrent_applies() -> usize {
    3
}

fn default_approval_ttl_secs() -> u64 {
    900
}

fn default_confirmation_ttl_secs() -> u64 {
    300
}

fn default_required_services() -> Vec<String> {
    vec!["mysql".to_string(), "dovecot".to_string(), "exim4".to_string()]
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            state_dir: default_state_dir(),
            scratch_dir: default_scratch_dir(),
            home_root: default_home_root(),
            spool_dir: default_spool_dir(),
            audit_log_path: default_audit_log_path(),
            max_backup_size_bytes: default_max_backup_size_bytes(),
            max_concurrent_applies: default_max_concurrent_applies(),
            approval_ttl_secs: default_approval_ttl_secs(),
            confirmation_ttl_secs: default_confirmation_ttl_secs(),
            required_services: default_required_services(),
        }
    }
}

impl MigrationConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Every directory under one root. Used by tests and `inspect`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            socket_path: root.join("agent.sock"),
            state_dir: root.join("state"),
            scratch_dir: root.join("scratch"),
            home_root: root.join("home"),
            spool_dir: root.join("spool"),
            audit_log_path: root.join("audit.log"),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let paths = [
            ("socket_path", &self.socket_path),
            ("state_dir", &self.state_dir),
            ("scratch_dir", &self.scratch_dir),
            ("home_root", &self.home_root),
            ("spool_dir", &self.spool_dir),
            ("audit_log_path", &self.audit_log_path),
        ];
        for (name, path) in paths {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid(format!("{} must be an absolute path", name)));
            }
        }
        if self.max_concurrent_applies == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_applies must be at least 1".to_string(),
            ));
        }
        if self.max_backup_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_backup_size_bytes must be positive".to_string(),
            ));
        }
        if self.approval_ttl_secs == 0 || self.confirmation_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token lifetimes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn approval_ttl(&self) -> Duration {
        Duration::from_secs(self.approval_ttl_secs)
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.confirmation_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::default();
        assert_eq!(config.max_backup_size_bytes, 536_870_912_000);
        assert_eq!(config.max_concurrent_applies, 3);
        assert_eq!(config.approval_ttl(), Duration::from_secs(900));
        assert_eq!(config.confirmation_ttl(), Duration::from_secs(300));
        assert_eq!(config.required_services, vec!["mysql", "dovecot", "exim4"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrad.json");
        fs::write(&path, r#"{"max_concurrent_applies": 5, "home_root": "/srv/home"}"#).unwrap();

        let config = MigrationConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_applies, 5);
        assert_eq!(config.home_root, PathBuf::from("/srv/home"));
        assert_eq!(config.state_dir, default_state_dir());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrad.json");
        fs::write(&path, r#"{"max_concurent_applies": 5}"#).unwrap();

        let err = MigrationConfig::load(&path).unwrap_err();
        assert_eq!(err.code(), "MIGRATE_CONFIG_PARSE");
    }

    #[test]
    fn test_validation() {
        let config = MigrationConfig {
            max_concurrent_applies: 0,
            ..MigrationConfig::default()
        };
        assert!(config.validate().is_err());

        let config = MigrationConfig {
            state_dir: PathBuf::from("relative"),
            ..MigrationConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), "MIGRATE_CONFIG_INVALID");
    }
}
