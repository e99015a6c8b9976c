use clusterops_core::CoreError;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    /// No dispatch route matches the phase id.
    #[error("unknown phase {0:?}")]
    UnknownPhase(String),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("failed to construct client for phase {phase}: {source}")]
    ClientUnavailable {
        phase: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("phase {phase} failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection problem with {peer}: {message}")]
    ConnectionProblem {
        peer: String,
        message: String,
        #[source]
        source: Option<Box<OrchestratorError>>,
    },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kubernetes API error ({status}): {message}")]
    Kubernetes { status: u16, message: String },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Marks an error that no retry loop may retry.
    #[error("permanent failure: {0}")]
    Permanent(#[source] Box<OrchestratorError>),

    #[error("rollback failed for {}", describe_failures(.failures))]
    RollbackFailed { failures: Vec<RollbackFailure> },

    #[error(transparent)]
    ExitCode(#[from] ExitCodeError),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::PlanNotFound(id) => Self::PlanNotFound(id),
            CoreError::PhaseNotFound(id) => Self::PhaseNotFound(id),
            CoreError::InvalidStateTransition { from, to } => Self::InvalidTransition { from, to },
            CoreError::Validation(message) => Self::MalformedPlan(message),
            CoreError::BadParameter(message) => Self::BadParameter(message),
            CoreError::Yaml(e) => Self::BadParameter(e.to_string()),
            other @ (CoreError::IncompleteChildren { .. } | CoreError::Conflict(_)) => {
                Self::Conflict(other.to_string())
            }
        }
    }
}

impl OrchestratorError {
    pub fn phase_failed(phase: impl Into<String>, source: OrchestratorError) -> Self {
        Self::PhaseFailed {
            phase: phase.into(),
            source: Box::new(source),
        }
    }

    pub fn connection_problem(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionProblem {
            peer: peer.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Process exit code carried by this error or any error it wraps.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ExitCode(e) => e.code,
            Self::Permanent(inner)
            | Self::ClientUnavailable { source: inner, .. }
            | Self::PhaseFailed { source: inner, .. }
            | Self::ConnectionProblem {
                source: Some(inner),
                ..
            } => inner.exit_code(),
            Self::RollbackFailed { failures } => failures
                .iter()
                .map(|f| f.error.exit_code())
                .find(|&code| code != 1)
                .unwrap_or(1),
            _ => 1,
        }
    }

    /// Strips wrapper variants down to the error that caused them.
    pub fn orig_error(&self) -> &OrchestratorError {
        match self {
            Self::ExitCode(ExitCodeError {
                source: Some(inner),
                ..
            })
            | Self::Permanent(inner)
            | Self::ClientUnavailable { source: inner, .. }
            | Self::PhaseFailed { source: inner, .. }
            | Self::ConnectionProblem {
                source: Some(inner),
                ..
            } => inner.orig_error(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.orig_error(), Self::Kubernetes { status: 404, .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.orig_error(), Self::Kubernetes { status: 409, .. })
    }
}

/// A phase whose rollback did not succeed.
#[derive(Debug)]
pub struct RollbackFailure {
    pub phase: String,
    pub error: OrchestratorError,
}

fn describe_failures(failures: &[RollbackFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.phase, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error that preserves a non-zero process exit code.
#[derive(Debug)]
pub struct ExitCodeError {
    code: i32,
    message: Option<String>,
    source: Option<Box<OrchestratorError>>,
}

impl ExitCodeError {
    pub fn new(code: i32) -> Self {
        Self {
            code: nonzero(code),
            message: None,
            source: None,
        }
    }

    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: nonzero(code),
            message: Some(message.into()),
            source: None,
        }
    }

    pub fn wrap(code: i32, err: OrchestratorError) -> Self {
        Self {
            code: nonzero(code),
            message: None,
            source: Some(Box::new(err)),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.code
    }

    /// The wrapped error, if any.
    pub fn orig_error(&self) -> Option<&OrchestratorError> {
        self.source.as_deref()
    }
}

fn nonzero(code: i32) -> i32 {
    if code == 0 {
        1
    } else {
        code
    }
}

impl fmt::Display for ExitCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.source, &self.message) {
            (Some(err), _) => write!(f, "{}", err),
            (None, Some(message)) => write!(f, "{}", message),
            (None, None) => write!(f, "exit with code {}", self.code),
        }
    }
}

impl std::error::Error for ExitCodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_survives_wrapping() {
        let err = OrchestratorError::from(ExitCodeError::with_message(3, "precondition not met"));
        let wrapped = OrchestratorError::phase_failed("/checks", err);

        assert_eq!(wrapped.exit_code(), 3);
        assert!(wrapped.to_string().contains("precondition not met"));
    }

    #[test]
    fn test_exit_code_survives_rollback_failures() {
        let err = OrchestratorError::RollbackFailed {
            failures: vec![
                RollbackFailure {
                    phase: "/c".to_string(),
                    error: OrchestratorError::Remote("boom".to_string()),
                },
                RollbackFailure {
                    phase: "/b".to_string(),
                    error: OrchestratorError::ExitCode(ExitCodeError::new(3)),
                },
            ],
        };
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_survives_connection_problem() {
        let err = OrchestratorError::ConnectionProblem {
            peer: "10.0.0.5".to_string(),
            message: "agent exited".to_string(),
            source: Some(Box::new(OrchestratorError::ExitCode(ExitCodeError::wrap(
                5,
                OrchestratorError::Kubernetes {
                    status: 409,
                    message: "already exists".to_string(),
                },
            )))),
        };
        assert_eq!(err.exit_code(), 5);
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_exit_code_default() {
        assert_eq!(OrchestratorError::Cancelled.exit_code(), 1);
        assert_eq!(ExitCodeError::new(0).exit_code(), 1);
        assert_eq!(ExitCodeError::new(2).to_string(), "exit with code 2");
    }

    #[test]
    fn test_orig_error_unwraps() {
        let inner = OrchestratorError::Kubernetes {
            status: 404,
            message: "configmaps \"openebs-ndm-config\" not found".to_string(),
        };
        let err = OrchestratorError::ExitCode(ExitCodeError::wrap(
            4,
            OrchestratorError::Permanent(Box::new(inner)),
        ));

        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
        assert!(matches!(
            err.orig_error(),
            OrchestratorError::Kubernetes { status: 404, .. }
        ));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_core_error_conversion() {
        let err: OrchestratorError = CoreError::Validation("cycle".to_string()).into();
        assert!(matches!(err, OrchestratorError::MalformedPlan(_)));

        let err: OrchestratorError = CoreError::Conflict("not done".to_string()).into();
        assert!(matches!(err, OrchestratorError::Conflict(_)));

        let err: OrchestratorError = CoreError::IncompleteChildren {
            phase: "/masters".to_string(),
            pending: "/masters/node-2".to_string(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[test]
    fn test_rollback_failed_display() {
        let err = OrchestratorError::RollbackFailed {
            failures: vec![RollbackFailure {
                phase: "/b".to_string(),
                error: OrchestratorError::Remote("boom".to_string()),
            }],
        };
        assert_eq!(err.to_string(), "rollback failed for /b (remote error: boom)");
    }
}
