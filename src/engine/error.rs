use ulid::Ulid;

use crate::model::{Action, AppointmentStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input: missing field, non-positive duration, bad timestamp, limit exceeded.
    Validation(String),
    NotFound(Ulid),
    Unauthorized {
        actor: Ulid,
        action: Action,
    },
    InvalidTransition {
        from: AppointmentStatus,
        action: Action,
        allowed: Vec<Action>,
    },
    /// Committing would double-book `resource_id`.
    Conflict {
        resource_id: Ulid,
        appointment_id: Option<Ulid>,
    },
    Storage(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Client errors are the caller's to fix; only storage failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Conflict { .. } => "conflict",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Unauthorized { actor, action } => {
                write!(f, "actor {actor} may not {action} this appointment")
            }
            EngineError::InvalidTransition { from, action, allowed } => {
                let allowed: Vec<&str> = allowed.iter().map(|a| a.as_str()).collect();
                write!(
                    f,
                    "cannot {action} an appointment in status {from}; allowed: [{}]",
                    allowed.join(", ")
                )
            }
            EngineError::Conflict { resource_id, appointment_id: Some(other) } => write!(
                f,
                "resource has conflicting appointments: {resource_id} is booked by {other}"
            ),
            EngineError::Conflict { resource_id, appointment_id: None } => write!(
                f,
                "resource has conflicting appointments: {resource_id} is unavailable"
            ),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
