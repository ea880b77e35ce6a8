//! Free-space preflight
//!
//! Restoring a backup needs room for the extracted copy plus the restored
//! data, so the requirement is twice the archive size.

use std::path::Path;

use nix::sys::statvfs::statvfs;

use super::errors::{ArchiveError, ArchiveResult};

/// Multiplier applied to the backup size.
pub const SPACE_FACTOR: u64 = 2;

/// Reports available bytes on the filesystem holding a path.
pub trait DiskSpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> ArchiveResult<u64>;
}

/// Probe backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskSpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> ArchiveResult<u64> {
        let stat = statvfs(path).map_err(|errno| ArchiveError::io(path, errno.into()))?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

/// Probe that always reports the same figure.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub u64);

impl DiskSpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self, _path: &Path) -> ArchiveResult<u64> {
        Ok(self.0)
    }
}

/// Fail with `InsufficientSpace` unless `root` has room for the backup.
pub fn check_disk_space(
    probe: &dyn DiskSpaceProbe,
    root: &Path,
    backup_size: u64,
) -> ArchiveResult<u64> {
    let required = backup_size.saturating_mul(SPACE_FACTOR);
    let available = probe.available_bytes(root)?;
    if available < required {
        return Err(ArchiveError::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_hundred_gib_backup_needs_two_hundred() {
        let probe = FixedSpaceProbe(150 * GIB);
        let err = check_disk_space(&probe, Path::new("/home"), 100 * GIB).unwrap_err();
        match err {
            ArchiveError::InsufficientSpace {
                required,
                available,
            } => {
                assert_eq!(required, 200 * GIB);
                assert_eq!(available, 150 * GIB);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exact_fit_passes() {
        let probe = FixedSpaceProbe(200);
        assert_eq!(check_disk_space(&probe, Path::new("/"), 100).unwrap(), 200);
    }

    #[test]
    fn test_statvfs_reports_something_for_tmp() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatvfsProbe.available_bytes(dir.path()).is_ok());
    }
}
