//! Agent response types
//!
//! `{"success": true, ...operation fields}` or
//! `{"success": false, "error": "...", "code": "..."}`.

use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::AgentError;

const FALLBACK_ERROR: &str =
    r#"{"success":false,"error":"internal error","code":"MIGRATE_AGENT_INTERNAL"}"#;

/// Error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
}

impl ErrorResponse {
    pub fn from_error(err: &AgentError) -> Self {
        let space = err.space_figures();
        Self {
            success: false,
            error: err.operator_message(),
            code: err.code().to_string(),
            required_bytes: space.map(|(required, _)| required),
            available_bytes: space.map(|(_, available)| available),
        }
    }

    fn internal() -> Self {
        Self {
            success: false,
            error: "internal error".to_string(),
            code: "MIGRATE_AGENT_INTERNAL".to_string(),
            required_bytes: None,
            available_bytes: None,
        }
    }
}

/// Unified response type
#[derive(Debug, Clone)]
pub enum Response {
    Success(Map<String, Value>),
    Error(ErrorResponse),
}

impl Response {
    /// Success response carrying the fields of `body`, which must serialize to an object.
    pub fn success<T: Serialize>(body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(Value::Object(mut fields)) => {
                fields.insert("success".to_string(), Value::Bool(true));
                Response::Success(fields)
            }
            _ => Response::Error(ErrorResponse::internal()),
        }
    }

    pub fn error(err: &AgentError) -> Self {
        Response::Error(ErrorResponse::from_error(err))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    /// Field of a success body.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Response::Success(fields) => fields.get(name),
            Response::Error(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Response::Success(fields) => Value::Object(fields.clone()),
            Response::Error(e) => {
                serde_json::to_value(e).unwrap_or_else(|_| Value::String(FALLBACK_ERROR.into()))
            }
        }
    }

    /// One response line, without the trailing newline.
    pub fn to_json(&self) -> String {
        let encoded = match self {
            Response::Success(fields) => serde_json::to_string(fields),
            Response::Error(e) => serde_json::to_string(e),
        };
        encoded.unwrap_or_else(|_| FALLBACK_ERROR.to_string())
    }
}
