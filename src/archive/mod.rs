//! Legacy backup archives
//!
//! - `inspector`: format detection and size/existence checks, header only
//! - `space`: free-space preflight against the target filesystem
//! - `extractor`: streaming, traversal-safe extraction into a scratch guard

mod errors;
pub mod extractor;
pub mod inspector;
pub mod space;

pub use errors::{ArchiveError, ArchiveResult};
pub use extractor::{
    confined_path, extract_archive, extract_stream, ExtractionStats, ScratchDir,
};
pub use inspector::{
    check_file, detect_format, source_user_hint, BackupFormat, DetectedFormat, HeaderKind,
};
pub use space::{check_disk_space, DiskSpaceProbe, FixedSpaceProbe, StatvfsProbe, SPACE_FACTOR};
