//! Streaming, traversal-safe archive extraction
//!
//! - Entries are read one at a time from the tar stream (gunzipped when the
//!   header says gzip); nothing is buffered whole
//! - Every entry path is lexically normalized against the scratch root;
//!   absolute paths and paths that climb out of the root are dropped
//! - Only directories and regular files are materialized
//! - The scratch directory is owned by a guard and removed on drop

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use uuid::Uuid;

use super::errors::{ArchiveError, ArchiveResult};
use crate::observability::Logger;

/// Counters reported after extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub files: usize,
    pub directories: usize,
    /// Bytes of regular-file content written
    pub bytes: u64,
    /// Entries dropped because their path escaped the scratch root
    pub skipped_entries: usize,
    /// Links, devices and other kinds that were not materialized
    pub ignored_entries: usize,
}

/// Private scratch directory, removed when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<parent>/<label>-<uuid>` with mode 0700.
    pub fn create(parent: &Path, label: &str) -> ArchiveResult<Self> {
        fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;

        let path = parent.join(format!("{}-{}", label, Uuid::new_v4()));
        fs::create_dir(&path).map_err(|e| ArchiveError::io(&path, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700))
            .map_err(|e| ArchiveError::io(&path, e))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                Logger::warn(
                    "SCRATCH_CLEANUP_FAILED",
                    &[
                        ("path", &self.path.display().to_string()),
                        ("error", &e.to_string()),
                    ],
                );
            }
        }
    }
}

/// Where an archive entry would land.
#[derive(Debug, PartialEq, Eq)]
enum EntryTarget {
    /// Relative path strictly inside the root
    Inside(PathBuf),
    /// Normalizes to the root itself (`./`)
    Root,
    /// Absolute, or climbs above the root
    Escapes,
}

fn normalize_entry_path(path: &Path) -> EntryTarget {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return EntryTarget::Escapes;
                }
            }
            Component::RootDir | Component::Prefix(_) => return EntryTarget::Escapes,
        }
    }

    if normalized.as_os_str().is_empty() {
        EntryTarget::Root
    } else {
        EntryTarget::Inside(normalized)
    }
}

/// `root.join(relative)` when `relative` stays strictly inside `root`.
pub fn confined_path(root: &Path, relative: &str) -> Option<PathBuf> {
    match normalize_entry_path(Path::new(relative)) {
        EntryTarget::Inside(rel) => Some(root.join(rel)),
        EntryTarget::Root | EntryTarget::Escapes => None,
    }
}

/// Extract `archive` into `dest`, which must already exist.
pub fn extract_archive(archive: &Path, gzip: bool, dest: &Path) -> ArchiveResult<ExtractionStats> {
    let file = File::open(archive).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ArchiveError::NotFound(archive.to_path_buf()),
        _ => ArchiveError::io(archive, e),
    })?;
    let reader = BufReader::new(file);

    if gzip {
        extract_stream(GzDecoder::new(reader), dest)
    } else {
        extract_stream(reader, dest)
    }
}

/// Extract a tar stream into `dest`.
pub fn extract_stream<R: Read>(reader: R, dest: &Path) -> ArchiveResult<ExtractionStats> {
    let mut archive = Archive::new(reader);
    let mut stats = ExtractionStats::default();

    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::Extraction(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::Extraction(e.to_string()))?;

        let raw_path = match entry.path() {
            Ok(p) => p.into_owned(),
            Err(_) => {
                stats.skipped_entries += 1;
                continue;
            }
        };

        let relative = match normalize_entry_path(&raw_path) {
            EntryTarget::Inside(rel) => rel,
            EntryTarget::Root => continue,
            EntryTarget::Escapes => {
                stats.skipped_entries += 1;
                Logger::warn(
                    "EXTRACT_ENTRY_REJECTED",
                    &[("entry", &raw_path.display().to_string())],
                );
                continue;
            }
        };
        let target = dest.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| ArchiveError::io(&target, e))?;
                stats.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
                }
                let mut out = File::create(&target).map_err(|e| ArchiveError::io(&target, e))?;
                let written = io::copy(&mut entry, &mut out).map_err(|e| {
                    ArchiveError::Extraction(format!("{}: {}", relative.display(), e))
                })?;
                stats.files += 1;
                stats.bytes += written;
            }
            other => {
                stats.ignored_entries += 1;
                Logger::trace(
                    "EXTRACT_ENTRY_IGNORED",
                    &[
                        ("entry", &relative.display().to_string()),
                        ("kind", &format!("{:?}", other)),
                    ],
                );
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, body: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, path, body).unwrap();
    }

    /// Write a raw name into the header so `..` survives the builder's checks.
    fn append_raw(builder: &mut Builder<Vec<u8>>, raw_name: &str, body: &[u8]) {
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

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path(Path::new("a/./b/../c")),
            EntryTarget::Inside(PathBuf::from("a/c"))
        );
        assert_eq!(normalize_entry_path(Path::new("./")), EntryTarget::Root);
        assert_eq!(
            normalize_entry_path(Path::new("../../etc/passwd")),
            EntryTarget::Escapes
        );
        assert_eq!(
            normalize_entry_path(Path::new("a/../../b")),
            EntryTarget::Escapes
        );
        assert_eq!(normalize_entry_path(Path::new("/etc/shadow")), EntryTarget::Escapes);
    }

    #[test]
    fn test_confined_path() {
        let root = Path::new("/scratch/apply-1");
        assert_eq!(
            confined_path(root, "homedir/mail/example.com/info"),
            Some(root.join("homedir/mail/example.com/info"))
        );
        assert_eq!(
            confined_path(root, "homedir/mail/../etc/x"),
            Some(root.join("homedir/etc/x"))
        );
        assert_eq!(confined_path(root, "homedir/mail/example.com/../../../../etc"), None);
        assert_eq!(confined_path(root, "/etc/shadow"), None);
        assert_eq!(confined_path(root, "."), None);
    }

    #[test]
    fn test_traversal_entry_dropped_siblings_kept() {
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "cpmove-alice/version", b"11\n");
        append_raw(&mut builder, "../../etc/passwd", b"root::0:0::/:/bin/sh\n");
        append_file(&mut builder, "cpmove-alice/cp/alice", b"USER=alice\n");
        let bytes = builder.into_inner().unwrap();

        let outer = TempDir::new().unwrap();
        let dest = outer.path().join("scratch");
        fs::create_dir(&dest).unwrap();

        let stats = extract_stream(&bytes[..], &dest).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.skipped_entries, 1);
        assert!(dest.join("cpmove-alice/cp/alice").is_file());
        assert!(!outer.path().join("etc").exists());
    }

    #[test]
    fn test_symlinks_are_ignored() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "home/link", "/etc/passwd")
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let dir = TempDir::new().unwrap();
        let stats = extract_stream(&bytes[..], dir.path()).unwrap();
        assert_eq!(stats.ignored_entries, 1);
        assert!(!dir.path().join("home/link").exists());
    }

    #[test]
    fn test_corrupt_gzip_is_extraction_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cpmove-x.tar.gz");
        // valid gzip member header, then a deflate block with a reserved type
        let mut bytes = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22]);
        fs::write(&archive, bytes).unwrap();
        let dest = dir.path().join("out");
        fs::create_dir(&dest).unwrap();

        let err = extract_archive(&archive, true, &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::Extraction(_)));
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let parent = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchDir::create(parent.path(), "job").unwrap();
            fs::write(scratch.path().join("f"), b"x").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
