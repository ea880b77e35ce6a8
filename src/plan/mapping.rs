//! Source to target identifier mapping
//!
//! Derived from a plan on demand, never persisted. Databases and database
//! users carrying the legacy `<source_user>_` prefix are renamed onto the
//! target account's prefix.

use std::collections::BTreeMap;

use serde::Serialize;

use super::types::{ComponentClass, ComponentSet, MigrationPlan, RestoreMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureMapping {
    pub source_user: String,
    pub target_user: String,
    pub domains: BTreeMap<String, String>,
    pub databases: BTreeMap<String, String>,
    pub database_users: BTreeMap<String, String>,
    /// Restore mode per selected component class
    pub modes: BTreeMap<ComponentClass, RestoreMode>,
}

/// Apply the account prefix rename to one identifier.
pub fn rename_prefixed(source_user: &str, target_user: &str, name: &str) -> String {
    if source_user == target_user {
        return name.to_string();
    }
    match name.strip_prefix(source_user).and_then(|r| r.strip_prefix('_')) {
        Some(rest) => format!("{}_{}", target_user, rest),
        None => name.to_string(),
    }
}

impl StructureMapping {
    pub fn build(plan: &MigrationPlan, components: &ComponentSet, mode: RestoreMode) -> Self {
        let rename = |name: &str| rename_prefixed(&plan.source_user, &plan.target_user, name);

        let domains = plan
            .domains
            .iter()
            .map(|d| (d.name.clone(), d.name.clone()))
            .collect();

        let databases = plan
            .databases
            .iter()
            .map(|db| (db.name.clone(), rename(&db.name)))
            .collect();

        let database_users = plan
            .databases
            .iter()
            .filter_map(|db| db.db_user.as_deref())
            .map(|u| (u.to_string(), rename(u)))
            .collect();

        let modes = components.iter().map(|c| (c, mode)).collect();

        Self {
            source_user: plan.source_user.clone(),
            target_user: plan.target_user.clone(),
            domains,
            databases,
            database_users,
            modes,
        }
    }

    /// Target name of a source database.
    pub fn database(&self, source: &str) -> String {
        self.databases
            .get(source)
            .cloned()
            .unwrap_or_else(|| rename_prefixed(&self.source_user, &self.target_user, source))
    }

    pub fn database_user(&self, source: &str) -> String {
        self.database_users
            .get(source)
            .cloned()
            .unwrap_or_else(|| rename_prefixed(&self.source_user, &self.target_user, source))
    }

    pub fn mode(&self, class: ComponentClass) -> Option<RestoreMode> {
        self.modes.get(&class).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::{DatabaseType, MigrationDatabase};

    #[test]
    fn test_prefix_rename() {
        assert_eq!(rename_prefixed("olduser", "alice", "olduser_wp"), "alice_wp");
        assert_eq!(rename_prefixed("olduser", "alice", "olduserx_wp"), "olduserx_wp");
        assert_eq!(rename_prefixed("olduser", "alice", "shared"), "shared");
        assert_eq!(rename_prefixed("alice", "alice", "alice_wp"), "alice_wp");
    }

    #[test]
    fn test_build_maps_databases_and_users() {
        let mut plan = MigrationPlan::new("alice", "olduser");
        plan.databases.push(MigrationDatabase {
            name: "olduser_wp".to_string(),
            db_type: DatabaseType::Mysql,
            db_user: Some("olduser_wpu".to_string()),
            size: 0,
            table_count: 0,
            owner: "olduser".to_string(),
            dump_file: "mysql/olduser_wp.sql".to_string(),
        });

        let components: ComponentSet = [ComponentClass::Databases].into_iter().collect();
        let mapping = StructureMapping::build(&plan, &components, RestoreMode::Overwrite);

        assert_eq!(mapping.database("olduser_wp"), "alice_wp");
        assert_eq!(mapping.database_user("olduser_wpu"), "alice_wpu");
        assert_eq!(
            mapping.mode(ComponentClass::Databases),
            Some(RestoreMode::Overwrite)
        );
        assert_eq!(mapping.mode(ComponentClass::Email), None);
    }
}
