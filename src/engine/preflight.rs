//! Backup preflight
//!
//! Checks that never extract the archive:
//! - existence, type and size (errors)
//! - format from naming and header bytes (warnings)
//! - free space at the home root (error)
//! - existing target account and required services (warnings)
//!
//! Validation is read-only: the same inputs against the same host state give
//! the same report.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{EngineContext, EngineResult};
use crate::archive::{check_disk_space, check_file, detect_format, ArchiveError, DetectedFormat};
use crate::plan::TARGET_USER_EXISTS_WARNING;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub backup_path: PathBuf,
    pub backup_size: u64,
    pub backup_format: String,
    /// Naming and header bytes agree on a supported format
    pub recognized: bool,
    #[serde(skip)]
    pub detected: Option<DetectedFormat>,
    /// Free bytes at the home root; absent when the format check stopped validation
    pub disk_available: Option<u64>,
    pub format_warnings: Vec<String>,
    pub target_user_exists: bool,
    pub missing_services: Vec<String>,
}

impl BackupReport {
    /// All non-fatal findings, in check order.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.format_warnings.clone();
        if self.target_user_exists {
            warnings.push(TARGET_USER_EXISTS_WARNING.to_string());
        }
        if let Some(w) = self.services_warning() {
            warnings.push(w);
        }
        warnings
    }

    pub fn services_warning(&self) -> Option<String> {
        if self.missing_services.is_empty() {
            None
        } else {
            Some(format!(
                "Required services not running: {}",
                self.missing_services.join(", ")
            ))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.recognized && self.warnings().is_empty()
    }
}

/// Run every preflight check for `backup_path` restored into `target_user`.
pub async fn validate_backup(
    ctx: &EngineContext,
    backup_path: &Path,
    target_user: &str,
) -> EngineResult<BackupReport> {
    let backup_size = check_file(backup_path, ctx.config.max_backup_size_bytes)?;

    let mut report = BackupReport {
        backup_path: backup_path.to_path_buf(),
        backup_size,
        backup_format: "unknown".to_string(),
        recognized: false,
        detected: None,
        disk_available: None,
        format_warnings: Vec::new(),
        target_user_exists: false,
        missing_services: Vec::new(),
    };

    match detect_format(backup_path) {
        Ok(detected) => {
            report.backup_format = detected.tag().to_string();
            report.recognized = detected.is_recognized();
            report.format_warnings = detected.warnings();
            report.detected = Some(detected);
        }
        Err(ArchiveError::UnknownFormat(detail)) => {
            report
                .format_warnings
                .push(format!("unknown backup format: {}", detail));
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    }

    report.disk_available = Some(check_disk_space(
        ctx.space.as_ref(),
        &ctx.config.home_root,
        backup_size,
    )?);

    report.target_user_exists = ctx.services.inventory.user_exists(target_user)?;
    report.missing_services = ctx
        .services
        .probe
        .missing_services(&ctx.config.required_services)
        .await?;

    Ok(report)
}
