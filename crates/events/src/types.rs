//! Event types published while cluster operations run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Plan events
    /// A plan was persisted for a new operation
    #[serde(rename = "plan.created")]
    PlanCreated {
        operation_id: Uuid,
        operation_kind: String,
        cluster_name: String,
    },

    /// An engine action (execute, resume, rollback) started on a plan
    #[serde(rename = "plan.started")]
    PlanStarted { operation_id: Uuid, action: String },

    /// Every phase reached a final state and the plan was closed
    #[serde(rename = "plan.completed")]
    PlanCompleted { operation_id: Uuid },

    // Phase events
    #[serde(rename = "phase.state_changed")]
    PhaseStateChanged {
        operation_id: Uuid,
        phase_id: String,
        from_state: String,
        to_state: String,
    },

    /// A retryable failure is about to be retried
    #[serde(rename = "phase.retrying")]
    PhaseRetrying {
        operation_id: Uuid,
        phase_id: String,
        attempt: u32,
        error: String,
    },

    #[serde(rename = "phase.failed")]
    PhaseFailed {
        operation_id: Uuid,
        phase_id: String,
        kind: String,
        message: String,
    },

    /// Rollback of a phase failed; the unwind continues with the next phase
    #[serde(rename = "phase.rollback_failed")]
    RollbackFailed {
        operation_id: Uuid,
        phase_id: String,
        message: String,
    },

    // Agent events
    /// A watched agent connection broke and in-flight remote work was cancelled
    #[serde(rename = "agent.disconnected")]
    PeerDisconnected {
        peer: String,
        operation_id: Option<Uuid>,
    },
}

impl Event {
    /// Get the operation ID associated with this event, if any
    pub fn operation_id(&self) -> Option<Uuid> {
        match self {
            Event::PlanCreated { operation_id, .. } => Some(*operation_id),
            Event::PlanStarted { operation_id, .. } => Some(*operation_id),
            Event::PlanCompleted { operation_id } => Some(*operation_id),
            Event::PhaseStateChanged { operation_id, .. } => Some(*operation_id),
            Event::PhaseRetrying { operation_id, .. } => Some(*operation_id),
            Event::PhaseFailed { operation_id, .. } => Some(*operation_id),
            Event::RollbackFailed { operation_id, .. } => Some(*operation_id),
            Event::PeerDisconnected { operation_id, .. } => *operation_id,
        }
    }

    /// Get the phase ID associated with this event, if any
    pub fn phase_id(&self) -> Option<&str> {
        match self {
            Event::PhaseStateChanged { phase_id, .. }
            | Event::PhaseRetrying { phase_id, .. }
            | Event::PhaseFailed { phase_id, .. }
            | Event::RollbackFailed { phase_id, .. } => Some(phase_id),
            _ => None,
        }
    }
}
