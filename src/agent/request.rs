//! Agent request types
//!
//! One JSON object per request: `action` selects the operation, `operator`
//! is optional and used for auditing only, every other key is a parameter of
//! that operation. Unknown parameters are rejected.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::{AgentError, AgentResult};
use crate::job::MigrationStatus;
use crate::plan::{ComponentClass, ComponentSet, RestoreMode};

const USERNAME_PATTERN: &str = "^[a-z0-9_-]{1,32}$";

/// Target usernames: lowercase letters, digits, `_` and `-`, at most 32.
pub fn validate_username(user: &str) -> AgentResult<()> {
    let re = Regex::new(USERNAME_PATTERN)
        .map_err(|e| AgentError::InvalidRequest(e.to_string()))?;
    if re.is_match(user) {
        Ok(())
    } else {
        Err(AgentError::parameter(
            "target_user",
            "must be 1-32 characters of a-z, 0-9, _ or -",
        ))
    }
}

/// Backup paths must be absolute with no `..` component.
pub fn validate_backup_path(path: &str) -> AgentResult<PathBuf> {
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return Err(AgentError::parameter("backup_path", "path must be absolute"));
    }
    if candidate.components().any(|c| c == Component::ParentDir) || path.contains("..") {
        return Err(AgentError::parameter("backup_path", "must not contain '..'"));
    }
    Ok(candidate.to_path_buf())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupParams {
    pub backup_path: String,
    pub target_user: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeParams {
    pub backup_path: String,
    pub target_user: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobParams {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyParams {
    pub job_id: Uuid,
    pub approval_token: String,
    #[serde(default)]
    pub overwrite_existing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetParams {
    pub target_user: String,
}

/// Components as a list (`["email","dns"]`) or a map of flags (`{"email":true}`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ComponentsParam {
    List(Vec<String>),
    Flags(BTreeMap<String, bool>),
}

impl ComponentsParam {
    pub fn to_set(&self) -> AgentResult<ComponentSet> {
        let names: Vec<&str> = match self {
            ComponentsParam::List(list) => list.iter().map(String::as_str).collect(),
            ComponentsParam::Flags(flags) => {
                for name in flags.keys() {
                    parse_class(name)?;
                }
                flags
                    .iter()
                    .filter(|(_, on)| **on)
                    .map(|(name, _)| name.as_str())
                    .collect()
            }
        };
        let set = names
            .into_iter()
            .map(parse_class)
            .collect::<AgentResult<ComponentSet>>()?;
        if set.is_empty() {
            return Err(AgentError::parameter(
                "components",
                "select at least one component",
            ));
        }
        Ok(set)
    }
}

fn parse_class(name: &str) -> AgentResult<ComponentClass> {
    ComponentClass::parse(name).ok_or_else(|| {
        AgentError::parameter(
            "components",
            format!("unknown component '{}' (expected files, databases, email, dns, ssl)", name),
        )
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectiveParams {
    pub backup_path: String,
    pub target_user: String,
    #[serde(default)]
    pub mode: Option<String>,
    pub components: ComponentsParam,
    #[serde(default)]
    pub confirmation_token: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl SelectiveParams {
    pub fn restore_mode(&self) -> AgentResult<RestoreMode> {
        match self.mode.as_deref() {
            None | Some("merge") => Ok(RestoreMode::Merge),
            Some("overwrite") => Ok(RestoreMode::Overwrite),
            Some(_) => Err(AgentError::parameter(
                "mode",
                "expected 'merge' or 'overwrite'",
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfirmOverwriteParams {
    pub target_user: String,
    /// Must repeat `target_user` exactly
    pub confirm: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<MigrationStatus>,
    #[serde(default)]
    pub target_user: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AgentRequest {
    ValidateBackup(BackupParams),
    AnalyzeBackup(AnalyzeParams),
    CreatePlan(JobParams),
    Preview(JobParams),
    Apply(ApplyParams),
    Validate(TargetParams),
    Rollback(JobParams),
    SelectiveRestore(SelectiveParams),
    ConfirmOverwrite(ConfirmOverwriteParams),
    JobStatus(JobParams),
    JobLogs(JobParams),
    ListJobs(ListParams),
}

/// A parsed request with its envelope fields.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub action: String,
    pub operator: Option<String>,
    pub request: AgentRequest,
}

fn params<T: DeserializeOwned>(action: &str, rest: Map<String, Value>) -> AgentResult<T> {
    serde_json::from_value(Value::Object(rest))
        .map_err(|e| AgentError::InvalidRequest(format!("{}: {}", action, e)))
}

impl AgentRequest {
    pub fn action(&self) -> &'static str {
        match self {
            AgentRequest::ValidateBackup(_) => "migration_validate_backup",
            AgentRequest::AnalyzeBackup(_) => "migration_analyze_backup",
            AgentRequest::CreatePlan(_) => "migration_create_plan",
            AgentRequest::Preview(_) => "migration_preview",
            AgentRequest::Apply(_) => "migration_apply",
            AgentRequest::Validate(_) => "migration_validate",
            AgentRequest::Rollback(_) => "migration_rollback",
            AgentRequest::SelectiveRestore(_) => "migration_selective_restore",
            AgentRequest::ConfirmOverwrite(_) => "migration_confirm_overwrite",
            AgentRequest::JobStatus(_) => "migration_job_status",
            AgentRequest::JobLogs(_) => "migration_job_logs",
            AgentRequest::ListJobs(_) => "migration_list_jobs",
        }
    }

    /// Parse one request line.
    pub fn parse(line: &str) -> AgentResult<Envelope> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| AgentError::InvalidRequest(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> AgentResult<Envelope> {
        let Value::Object(mut rest) = value else {
            return Err(AgentError::InvalidRequest(
                "request must be a JSON object".to_string(),
            ));
        };

        let action = match rest.remove("action") {
            Some(Value::String(action)) => action,
            Some(_) => {
                return Err(AgentError::InvalidRequest(
                    "action must be a string".to_string(),
                ))
            }
            None => return Err(AgentError::InvalidRequest("missing action".to_string())),
        };
        let operator = match rest.remove("operator") {
            None | Some(Value::Null) => None,
            Some(Value::String(op)) => Some(op),
            Some(_) => {
                return Err(AgentError::InvalidRequest(
                    "operator must be a string".to_string(),
                ))
            }
        };

        let a = action.as_str();
        let request = match a {
            "migration_validate_backup" => AgentRequest::ValidateBackup(params(a, rest)?),
            "migration_analyze_backup" => AgentRequest::AnalyzeBackup(params(a, rest)?),
            "migration_create_plan" => AgentRequest::CreatePlan(params(a, rest)?),
            "migration_preview" => AgentRequest::Preview(params(a, rest)?),
            "migration_apply" => AgentRequest::Apply(params(a, rest)?),
            "migration_validate" => AgentRequest::Validate(params(a, rest)?),
            "migration_rollback" => AgentRequest::Rollback(params(a, rest)?),
            "migration_selective_restore" => AgentRequest::SelectiveRestore(params(a, rest)?),
            "migration_confirm_overwrite" => AgentRequest::ConfirmOverwrite(params(a, rest)?),
            "migration_job_status" => AgentRequest::JobStatus(params(a, rest)?),
            "migration_job_logs" => AgentRequest::JobLogs(params(a, rest)?),
            "migration_list_jobs" => AgentRequest::ListJobs(params(a, rest)?),
            other => return Err(AgentError::UnknownAction(other.to_string())),
        };

        Ok(Envelope {
            action,
            operator,
            request,
        })
    }
}
