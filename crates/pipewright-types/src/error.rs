use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::Action;

/// A single JSON-Schema violation: where it happened and what was wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// JSON pointer into the validated instance (`""` for the root).
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {}", self.message)
    }
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the permission manager.
#[derive(Debug, Clone, Error)]
pub enum PermissionError {
    #[error("permission denied: role '{role}' may not {action} '{resource}'")]
    Denied {
        role: String,
        resource: String,
        action: Action,
    },

    #[error("invalid resource pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Errors from the context validator.
#[derive(Debug, Clone, Error)]
pub enum ContextValidationError {
    #[error("unknown schema: '{0}'")]
    UnknownSchema(String),

    #[error("invalid schema '{id}': {message}")]
    InvalidSchema { id: String, message: String },

    #[error("validation against '{schema_id}' failed: {}", join_violations(.violations))]
    Invalid {
        schema_id: String,
        violations: Vec<SchemaViolation>,
    },
}

/// I/O failures in the binary object storage backend.
#[derive(Debug, Error)]
pub enum StorageBackendError {
    #[error("binary storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage name: '{0}'")]
    InvalidName(String),

    #[error("binary object not found: {namespace}/{key}")]
    NotFound { namespace: String, key: String },
}

/// Failures in a JSON persistence backend.
///
/// These never escape the context service: the persistence manager turns
/// them into `false` plus an error log.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid persistence name: '{0}'")]
    InvalidName(String),
}

/// Errors raised by the context service.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionError),

    #[error(transparent)]
    Validation(#[from] ContextValidationError),

    #[error(transparent)]
    StorageBackend(#[from] StorageBackendError),

    #[error("context key not found: {namespace}.{key}")]
    NotFound { namespace: String, key: String },

    #[error("invalid binary descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("context value at {namespace}.{key} is not a list")]
    NotAList { namespace: String, key: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0} backend is not configured")]
    BackendUnavailable(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_error_display() {
        let err = PermissionError::Denied {
            role: "web".to_string(),
            resource: "jobs.status".to_string(),
            action: Action::Write,
        };
        assert_eq!(
            err.to_string(),
            "permission denied: role 'web' may not write 'jobs.status'"
        );
    }

    #[test]
    fn test_validation_error_lists_violations() {
        let err = ContextValidationError::Invalid {
            schema_id: "job".to_string(),
            violations: vec![
                SchemaViolation {
                    path: "/state".to_string(),
                    message: "not a string".to_string(),
                },
                SchemaViolation {
                    path: String::new(),
                    message: "missing 'id'".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("/state: not a string"), "got: {msg}");
        assert!(msg.contains("/: missing 'id'"), "got: {msg}");
    }

    #[test]
    fn test_context_error_is_transparent_for_permissions() {
        let err: ContextError = PermissionError::InvalidPattern {
            pattern: "(".to_string(),
            message: "unclosed group".to_string(),
        }
        .into();
        assert!(err.to_string().starts_with("invalid resource pattern"));
    }
}
