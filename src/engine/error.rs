use ulid::Ulid;

use crate::model::AppointmentStatus;

use super::availability::Availability;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// The requested window is not free. Carries the busy/closed verdict and
    /// the next slot, if one exists.
    Unavailable(Availability),
    Inactive(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "appointment {id} cannot move from {from} to {to}")
            }
            EngineError::Unavailable(verdict) => {
                let state = match verdict {
                    Availability::Available => "available",
                    Availability::Busy { .. } => "busy",
                    Availability::Closed { .. } => "closed",
                };
                match verdict.suggested() {
                    Some(at) => write!(f, "provider {state}; next free slot at {at}"),
                    None => write!(f, "provider {state}; no free slot in range"),
                }
            }
            EngineError::Inactive(id) => write!(f, "provider is deactivated: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
