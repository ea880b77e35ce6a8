//! Migration plans
//!
//! - `types`: the plan value object and component classes
//! - `parser`: extracted tree to plan, one independently fallible parser per concern
//! - `conflicts`: cross-reference against the target inventory
//! - `mapping`: source to target identifier translation

pub mod conflicts;
mod errors;
pub mod mapping;
pub mod parser;
pub mod types;

pub use conflicts::{
    detect_conflicts, Conflict, ConflictKind, ConflictReport, OverwriteAuthorization,
    TARGET_USER_EXISTS_WARNING,
};
pub use errors::{ParseError, ParseResult};
pub use mapping::{rename_prefixed, StructureMapping};
pub use parser::{locate_backup_root, parse_backup, tree_size, BackupMeta};
pub use types::{
    ComponentClass, ComponentSet, DatabaseType, DomainKind, MigrationDatabase, MigrationDnsZone,
    MigrationDomain, MigrationEmail, MigrationPlan, MigrationSsl, PlanSummary, RestoreMode,
};
