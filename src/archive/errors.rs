//! Archive inspection and extraction errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for archive operations
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors raised before or while reading a backup archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("backup file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("backup path is not a regular file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("backup file is {size} bytes, exceeding the {max} byte maximum")]
    TooLarge { size: u64, max: u64 },

    #[error("unknown backup format: {0}")]
    UnknownFormat(String),

    #[error("insufficient disk space: {required} bytes required, {available} bytes available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("archive extraction failed: {0}")]
    Extraction(String),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Message without host I/O detail.
    pub fn operator_message(&self) -> String {
        match self {
            ArchiveError::Io { .. } => "cannot read backup archive".to_string(),
            ArchiveError::Extraction(_) => "backup archive is corrupt or truncated".to_string(),
            other => other.to_string(),
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            ArchiveError::NotFound(_) => "MIGRATE_ARCHIVE_NOT_FOUND",
            ArchiveError::NotAFile(_) => "MIGRATE_ARCHIVE_NOT_A_FILE",
            ArchiveError::TooLarge { .. } => "MIGRATE_ARCHIVE_TOO_LARGE",
            ArchiveError::UnknownFormat(_) => "MIGRATE_ARCHIVE_UNKNOWN_FORMAT",
            ArchiveError::InsufficientSpace { .. } => "MIGRATE_ARCHIVE_INSUFFICIENT_SPACE",
            ArchiveError::Extraction(_) => "MIGRATE_ARCHIVE_EXTRACTION",
            ArchiveError::Io { .. } => "MIGRATE_ARCHIVE_IO",
        }
    }
}
