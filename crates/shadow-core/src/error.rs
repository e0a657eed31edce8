//! Error types for shadow-core.

use thiserror::Error;

/// Result type alias for shadow-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during shadow pod operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Resource (or every resource matching a selector) is absent
    #[error("{0} not found")]
    NotFound(String),

    /// Retry budget exhausted before the target phase was reached
    #[error("pod {resource} {reason}")]
    Timeout {
        /// Pod name or selector being waited on
        resource: String,
        /// Human readable cause
        reason: String,
    },

    /// A sideband annotation was present but not a valid integer
    #[error("failed to parse annotation {key} of pod {name} with value {value:?}")]
    Parse {
        /// Pod name
        name: String,
        /// Annotation key
        key: String,
        /// Raw annotation value
        value: String,
    },

    /// Ref-count decrement on a zero or invalid count
    #[error("invalid ref count on pod {name}: {reason}")]
    ContractViolation {
        /// Pod name
        name: String,
        /// Violated expectation
        reason: String,
    },

    /// Exec transport failed, or the remote command reported a failure on stderr
    #[error("{message}")]
    RemoteCommand {
        /// Extracted failure reason, or the raw transport error
        message: String,
        /// Cleaned stdout captured before the failure
        stdout: String,
        /// Cleaned stderr captured before the failure
        stderr: String,
    },

    /// Optimistic update lost against a concurrent writer
    #[error("conflict updating pod {0}")]
    Conflict(String),

    /// Any other failure reported by the resource store
    #[error("store error: {0}")]
    Store(String),

    /// Wait or watch aborted through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// True for [`CoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for [`CoreError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_resource() {
        let err = CoreError::Timeout {
            resource: "shadow-abc".into(),
            reason: "failed to start".into(),
        };
        assert_eq!(err.to_string(), "pod shadow-abc failed to start");
    }

    #[test]
    fn test_remote_command_displays_message_only() {
        let err = CoreError::RemoteCommand {
            message: "no such file".into(),
            stdout: "partial".into(),
            stderr: "error: 'no such file'".into(),
        };
        assert_eq!(err.to_string(), "no such file");
    }

    #[test]
    fn test_classifiers() {
        assert!(CoreError::NotFound("pod x".into()).is_not_found());
        assert!(!CoreError::Cancelled.is_not_found());
        assert!(CoreError::Conflict("x".into()).is_conflict());
    }
}
