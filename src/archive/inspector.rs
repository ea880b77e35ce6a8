//! Backup format detection
//!
//! Detection combines two independent signals:
//! - the file-name convention (`cpmove-<user>.tar.gz`, `cpmove-<user>.tar`,
//!   `cpbackup-*` / `backup-<date>_<user>.tar[.gz]`)
//! - the leading bytes (gzip magic, or the `ustar` marker of a tar header)
//!
//! At most one tar header block is read; the archive body is never touched.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{ArchiveError, ArchiveResult};

const HEADER_PROBE_LEN: usize = 512;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Supported legacy backup formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupFormat {
    #[serde(rename = "cpmove-tar.gz")]
    CpmoveTarGz,
    #[serde(rename = "cpmove-tar")]
    CpmoveTar,
    #[serde(rename = "cpbackup")]
    Cpbackup,
}

impl BackupFormat {
    /// Format tag reported to callers and stored in plans
    pub fn tag(&self) -> &'static str {
        match self {
            BackupFormat::CpmoveTarGz => "cpmove-tar.gz",
            BackupFormat::CpmoveTar => "cpmove-tar",
            BackupFormat::Cpbackup => "cpbackup",
        }
    }

    /// Classify a file name by convention alone.
    pub fn from_file_name(name: &str) -> Option<Self> {
        if let Some(rest) = name.strip_prefix("cpmove-") {
            if rest.ends_with(".tar.gz") || rest.ends_with(".tgz") {
                return Some(BackupFormat::CpmoveTarGz);
            }
            if rest.ends_with(".tar") {
                return Some(BackupFormat::CpmoveTar);
            }
            return None;
        }
        if name.starts_with("cpbackup-") {
            return Some(BackupFormat::Cpbackup);
        }
        if name.starts_with("backup-") && (name.ends_with(".tar.gz") || name.ends_with(".tar")) {
            return Some(BackupFormat::Cpbackup);
        }
        None
    }

    fn accepts(&self, header: HeaderKind) -> bool {
        match self {
            BackupFormat::CpmoveTarGz => header == HeaderKind::Gzip,
            BackupFormat::CpmoveTar => header == HeaderKind::Tar,
            BackupFormat::Cpbackup => matches!(header, HeaderKind::Gzip | HeaderKind::Tar),
        }
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// What the leading bytes look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Gzip,
    Tar,
    Unrecognized,
}

impl HeaderKind {
    fn classify(bytes: &[u8]) -> Self {
        if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
            return HeaderKind::Gzip;
        }
        if bytes.len() >= USTAR_OFFSET + USTAR_MAGIC.len()
            && &bytes[USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()] == USTAR_MAGIC
        {
            return HeaderKind::Tar;
        }
        HeaderKind::Unrecognized
    }

    fn describe(&self) -> &'static str {
        match self {
            HeaderKind::Gzip => "gzip data",
            HeaderKind::Tar => "an uncompressed tar archive",
            HeaderKind::Unrecognized => "neither gzip nor tar",
        }
    }
}

/// Result of format detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedFormat {
    /// Format implied by the file-name convention, if any
    pub format: Option<BackupFormat>,
    /// Format implied by the leading bytes
    pub header: HeaderKind,
}

impl DetectedFormat {
    /// True when naming and header bytes agree on a supported format.
    pub fn is_recognized(&self) -> bool {
        self.format.map(|f| f.accepts(self.header)).unwrap_or(false)
    }

    /// Whether the stream must be gunzipped before reading tar entries.
    pub fn is_gzip(&self) -> bool {
        self.header == HeaderKind::Gzip
    }

    /// Tag for plans and responses; `unknown` when naming did not match.
    pub fn tag(&self) -> &'static str {
        self.format.map(|f| f.tag()).unwrap_or("unknown")
    }

    /// Operator-facing explanations of why the backup is not recognized.
    pub fn warnings(&self) -> Vec<String> {
        match self.format {
            None => vec![
                "backup file name does not follow a supported convention \
                 (cpmove-*.tar.gz, cpmove-*.tar, cpbackup-*)"
                    .to_string(),
            ],
            Some(format) if !format.accepts(self.header) => vec![format!(
                "file name indicates {} but the header bytes are {} (corrupt backup?)",
                format,
                self.header.describe()
            )],
            Some(_) => Vec::new(),
        }
    }
}

/// Detect the backup format from the file name and its first header block.
pub fn detect_format(path: &Path) -> ArchiveResult<DetectedFormat> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let header = HeaderKind::classify(&read_header(path)?);
    let format = BackupFormat::from_file_name(&name);

    if format.is_none() && header == HeaderKind::Unrecognized {
        return Err(ArchiveError::UnknownFormat(format!(
            "{} (supported: cpmove-*.tar.gz, cpmove-*.tar, cpbackup-*)",
            name
        )));
    }

    Ok(DetectedFormat { format, header })
}

/// Legacy account name embedded in the file name, if the convention carries one.
pub fn source_user_hint(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let stem = name
        .strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tgz"))
        .or_else(|| name.strip_suffix(".tar"))?;

    let user = if let Some(user) = stem.strip_prefix("cpmove-") {
        user
    } else if stem.starts_with("backup-") || stem.starts_with("cpbackup-") {
        stem.rsplit('_').next()?
    } else {
        return None;
    };

    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

/// Existence, type and size checks. Returns the file size in bytes.
pub fn check_file(path: &Path, max_size: u64) -> ArchiveResult<u64> {
    let metadata = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ArchiveError::NotFound(path.to_path_buf()),
        _ => ArchiveError::io(path, e),
    })?;

    if !metadata.is_file() {
        return Err(ArchiveError::NotAFile(path.to_path_buf()));
    }

    let size = metadata.len();
    if size > max_size {
        return Err(ArchiveError::TooLarge {
            size,
            max: max_size,
        });
    }

    Ok(size)
}

fn read_header(path: &Path) -> ArchiveResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ArchiveError::NotFound(path.to_path_buf()),
        _ => ArchiveError::io(path, e),
    })?;

    let mut buf = Vec::with_capacity(HEADER_PROBE_LEN);
    (&mut file)
        .take(HEADER_PROBE_LEN as u64)
        .read_to_end(&mut buf)
        .map_err(|e| ArchiveError::io(path, e))?;
    Ok(buf)
}
