use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Invalid phase state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Phase {phase} has incomplete children: {pending}")]
    IncompleteChildren { phase: String, pending: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::new_v4();
        let error = CoreError::PlanNotFound(id);
        assert!(error.to_string().contains(&id.to_string()));

        let error = CoreError::PhaseNotFound("/masters/node-1".to_string());
        assert_eq!(error.to_string(), "Phase not found: /masters/node-1");
    }
}
