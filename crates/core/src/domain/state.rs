use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unstarted" => Some(Self::Unstarted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// States a plan may be finalized in.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn validate_transition(from: &PhaseState, to: &PhaseState) -> Result<(), CoreError> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidStateTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    // Failed -> InProgress is a retry; Completed -> RolledBack is an explicit unwind.
    fn allowed_transitions(from: &PhaseState) -> Vec<PhaseState> {
        match from {
            PhaseState::Unstarted => vec![PhaseState::InProgress],
            PhaseState::InProgress => vec![PhaseState::Completed, PhaseState::Failed],
            PhaseState::Completed => vec![PhaseState::RolledBack],
            PhaseState::Failed => vec![PhaseState::InProgress, PhaseState::RolledBack],
            PhaseState::RolledBack => vec![],
        }
    }

    pub fn can_transition(from: &PhaseState, to: &PhaseState) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}
