//! Per-concern parse errors
//!
//! Never fatal to analysis: each error becomes a plan warning of the form
//! `"<concern> parsing: <detail>"`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing {0}")]
    Missing(String),

    #[error("malformed {file}: {detail}")]
    Malformed { file: String, detail: String },

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ParseError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(file: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Malformed {
            file: file.into(),
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ParseError::Missing(_) => "MIGRATE_PARSE_MISSING",
            ParseError::Malformed { .. } => "MIGRATE_PARSE_MALFORMED",
            ParseError::Io { .. } => "MIGRATE_PARSE_IO",
        }
    }

    /// Plan warning text for a failed concern.
    pub fn as_warning(&self, concern: &str) -> String {
        format!("{} parsing: {}", concern, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_format() {
        let err = ParseError::Missing("dnszones/".to_string());
        assert_eq!(err.as_warning("dns"), "dns parsing: missing dnszones/");
        assert_eq!(err.code(), "MIGRATE_PARSE_MISSING");
    }
}
