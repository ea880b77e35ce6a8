//! Conflict detection against current target state
//!
//! Three kinds, with different ways out:
//! - `TargetUserExists`: surfaced as a plan warning, needs `overwrite_existing`
//! - `ExistingData`: the target account already owns the item, needs overwrite
//!   authorization
//! - `ForeignOwner`: another account owns the item, only excluding the
//!   component class clears it

use serde::{Deserialize, Serialize};

use super::mapping::StructureMapping;
use super::types::{ComponentClass, ComponentSet, MigrationPlan};
use crate::services::{ServiceResult, TargetInventory};

pub const TARGET_USER_EXISTS_WARNING: &str =
    "Target user already exists. Set overwrite_existing=true to replace.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    TargetUserExists,
    ExistingData,
    ForeignOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// Component class the conflicting item belongs to; `None` for the account itself
    pub component: Option<ComponentClass>,
    pub subject: String,
    pub description: String,
}

/// What the caller has authorized to be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverwriteAuthorization {
    pub existing_user: bool,
    pub existing_data: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConflictReport {
    pub conflicts: Vec<Conflict>,
}

impl ConflictReport {
    pub fn target_user_exists(&self) -> bool {
        self.conflicts
            .iter()
            .any(|c| c.kind == ConflictKind::TargetUserExists)
    }

    /// Rebuild the report recorded in a plan by `record_in`.
    pub fn from_plan(plan: &MigrationPlan) -> Self {
        let mut conflicts = Vec::new();
        if plan.warnings.iter().any(|w| w == TARGET_USER_EXISTS_WARNING) {
            conflicts.push(Conflict {
                kind: ConflictKind::TargetUserExists,
                component: None,
                subject: plan.target_user.clone(),
                description: TARGET_USER_EXISTS_WARNING.to_string(),
            });
        }
        conflicts.extend(plan.conflicts.iter().cloned());
        Self { conflicts }
    }

    /// Conflicts that still block an apply restricted to `components`.
    pub fn blocking(
        &self,
        components: &ComponentSet,
        auth: OverwriteAuthorization,
    ) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| {
                let selected = c.component.map(|cls| components.contains(cls)).unwrap_or(true);
                match c.kind {
                    ConflictKind::TargetUserExists => !auth.existing_user,
                    ConflictKind::ExistingData => selected && !auth.existing_data,
                    ConflictKind::ForeignOwner => selected,
                }
            })
            .collect()
    }

    /// Record into a plan: the account conflict as a warning, the rest as conflicts.
    pub fn record_in(self, plan: &mut MigrationPlan) {
        for conflict in self.conflicts {
            if conflict.kind == ConflictKind::TargetUserExists {
                plan.warnings.push(conflict.description);
            } else {
                plan.conflicts.push(conflict);
            }
        }
    }
}

/// Cross-reference a plan against the target inventory.
pub fn detect_conflicts(
    plan: &MigrationPlan,
    mapping: &StructureMapping,
    inventory: &dyn TargetInventory,
) -> ServiceResult<ConflictReport> {
    let target = plan.target_user.as_str();
    let mut report = ConflictReport::default();

    if inventory.user_exists(target)? {
        report.conflicts.push(Conflict {
            kind: ConflictKind::TargetUserExists,
            component: None,
            subject: target.to_string(),
            description: TARGET_USER_EXISTS_WARNING.to_string(),
        });
    }

    for domain in &plan.domains {
        if let Some(owner) = inventory.domain_owner(&domain.name)? {
            report.conflicts.push(ownership_conflict(
                ComponentClass::Files,
                &domain.name,
                "domain",
                &owner,
                target,
            ));
        }
    }

    for db in &plan.databases {
        let mapped = mapping.database(&db.name);
        if let Some(owner) = inventory.database_owner(&mapped)? {
            report.conflicts.push(ownership_conflict(
                ComponentClass::Databases,
                &mapped,
                "database",
                &owner,
                target,
            ));
        }
    }

    for mail in &plan.email_accounts {
        if inventory.mailbox_exists(&mail.address)? {
            report.conflicts.push(Conflict {
                kind: ConflictKind::ExistingData,
                component: Some(ComponentClass::Email),
                subject: mail.address.clone(),
                description: format!("mailbox {} already exists", mail.address),
            });
        }
    }

    for zone in &plan.dns_zones {
        if let Some(owner) = inventory.domain_owner(&zone.zone_name)? {
            if owner != target {
                report.conflicts.push(ownership_conflict(
                    ComponentClass::Dns,
                    &zone.zone_name,
                    "DNS zone",
                    &owner,
                    target,
                ));
            }
        }
    }

    Ok(report)
}

fn ownership_conflict(
    component: ComponentClass,
    subject: &str,
    noun: &str,
    owner: &str,
    target: &str,
) -> Conflict {
    if owner == target {
        Conflict {
            kind: ConflictKind::ExistingData,
            component: Some(component),
            subject: subject.to_string(),
            description: format!("{} {} already exists for {}", noun, subject, target),
        }
    } else {
        Conflict {
            kind: ConflictKind::ForeignOwner,
            component: Some(component),
            subject: subject.to_string(),
            description: format!("{} {} is owned by another account", noun, subject),
        }
    }
}
