//! Per-job execution logs at `<state_dir>/logs/<id>.log`
//!
//! Plain text, one line per event, append-only.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use crate::observability::{Logger, Severity};

const LOGS_DIR: &str = "logs";

#[derive(Debug, Clone)]
pub struct JobLogs {
    dir: PathBuf,
}

impl JobLogs {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join(LOGS_DIR),
        }
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }
}

/// Append one line. Failures are reported to the process log only.
pub fn append(path: &Path, severity: Severity, message: &str) {
    if let Err(e) = try_append(path, severity, message) {
        Logger::warn(
            "JOB_LOG_WRITE_FAILED",
            &[
                ("error", &e.to_string()),
                ("path", &path.display().to_string()),
            ],
        );
    }
}

fn try_append(path: &Path, severity: Severity, message: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "{} {} {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        severity.as_str(),
        message
    )
}

/// Full log content; empty when nothing was written yet.
pub fn read(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let logs = JobLogs::new(dir.path());
        let path = logs.path_for(Uuid::new_v4());

        assert_eq!(read(&path).unwrap(), "");
        append(&path, Severity::Info, "analysis started");
        append(&path, Severity::Error, "step failed");

        let content = read(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO analysis started"));
        assert!(lines[1].contains("ERROR"));
    }
}
