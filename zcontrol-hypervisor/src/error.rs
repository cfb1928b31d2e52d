//! Error types for the hypervisor drivers.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::schema::{ConstraintKind, SchemaError, Violation, ViolationReport};
use crate::types::{Action, Family};

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The `parameters` document was rejected by the action schema.
    /// The driver was not called.
    #[error("Invalid parameters for {family}/{action}: {report}")]
    InvalidParameters {
        family: Family,
        action: Action,
        report: ViolationReport,
    },

    /// The backend rejected the credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The backend could not be reached or the transport broke.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// The backend reported a failure for an operation it accepted.
    #[error("Operation '{operation}' failed: {reason}")]
    OperationFailed {
        operation: String,
        reason: String,
        /// Diagnostic payload as reported by the backend.
        diagnostic: Option<Value>,
    },

    /// A bounded wait ran out.
    #[error("Timed out after {waited:?} waiting for {stage}")]
    Timeout { stage: String, waited: Duration },

    /// An operation needing a session was called before `login`.
    #[error("You need to login first")]
    NotLoggedIn,

    /// An operation was called on a session that was already closed.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// The backend or its current mode cannot perform the request.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Entity is in an invalid state for the requested operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// Schema repository could not be built.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameters,
    Authentication,
    Connectivity,
    Backend,
    Timeout,
    Session,
    Unsupported,
    Configuration,
    Schema,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidParameters => "invalid-parameters",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Backend => "backend",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Session => "session",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Schema => "schema",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl HypervisorError {
    /// Backend failure without a diagnostic payload.
    pub fn operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        HypervisorError::OperationFailed {
            operation: operation.into(),
            reason: reason.into(),
            diagnostic: None,
        }
    }

    /// Backend failure carrying the backend's own diagnostic.
    pub fn operation_with(operation: impl Into<String>, reason: impl Into<String>, diagnostic: Value) -> Self {
        HypervisorError::OperationFailed {
            operation: operation.into(),
            reason: reason.into(),
            diagnostic: Some(diagnostic),
        }
    }

    /// Parameter error for a rule the schema cannot express.
    pub fn invalid_parameters(
        family: Family,
        action: Action,
        path: &str,
        kind: ConstraintKind,
        message: impl Into<String>,
    ) -> Self {
        HypervisorError::InvalidParameters {
            family,
            action,
            report: ViolationReport::new(vec![Violation::new(path, kind, message)]),
        }
    }

    pub fn timeout(stage: impl Into<String>, waited: Duration) -> Self {
        HypervisorError::Timeout {
            stage: stage.into(),
            waited,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HypervisorError::InvalidParameters { .. } => ErrorKind::InvalidParameters,
            HypervisorError::AuthenticationFailed(_) => ErrorKind::Authentication,
            HypervisorError::ConnectionFailed(_) => ErrorKind::Connectivity,
            HypervisorError::OperationFailed { .. } => ErrorKind::Backend,
            HypervisorError::Timeout { .. } => ErrorKind::Timeout,
            HypervisorError::NotLoggedIn | HypervisorError::SessionClosed(_) => ErrorKind::Session,
            HypervisorError::NotSupported(_) => ErrorKind::Unsupported,
            HypervisorError::InvalidConfig(_) | HypervisorError::InvalidState(_) => ErrorKind::Configuration,
            HypervisorError::Schema(_) => ErrorKind::Schema,
            HypervisorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only transport faults and timeouts may succeed when tried again
    /// unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connectivity | ErrorKind::Timeout)
    }

    /// Violation report of a parameter error.
    pub fn report(&self) -> Option<&ViolationReport> {
        match self {
            HypervisorError::InvalidParameters { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Backend diagnostic of an operation failure.
    pub fn diagnostic(&self) -> Option<&Value> {
        match self {
            HypervisorError::OperationFailed { diagnostic, .. } => diagnostic.as_ref(),
            _ => None,
        }
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        assert!(HypervisorError::ConnectionFailed("reset by peer".into()).is_retryable());
        assert!(HypervisorError::timeout("rescue IPL", Duration::from_secs(5)).is_retryable());
        assert!(!HypervisorError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(!HypervisorError::operation("stop", "not operating").is_retryable());
        assert_eq!(HypervisorError::NotLoggedIn.kind(), ErrorKind::Session);
        assert_eq!(HypervisorError::InvalidConfig("x".into()).kind().to_string(), "configuration");
    }

    #[test]
    fn test_diagnostic_is_kept() {
        let err = HypervisorError::operation_with("activate", "rejected", json!({"http-status": 409, "reason": 1}));
        assert_eq!(err.diagnostic().unwrap()["reason"], 1);
        assert_eq!(err.to_string(), "Operation 'activate' failed: rejected");
    }

    #[test]
    fn test_invalid_parameters_carries_report() {
        let err = HypervisorError::invalid_parameters(
            Family::Zvm,
            Action::Start,
            "storage_volumes",
            ConstraintKind::Required,
            "boot method 'disk' requires a boot device",
        );
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        assert!(err.report().unwrap().find("storage_volumes", ConstraintKind::Required).is_some());
    }
}
