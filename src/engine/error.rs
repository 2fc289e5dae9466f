use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    /// Room or office does not exist.
    ResourceNotFound(Ulid),
    /// `end` not strictly after `start`.
    InvalidInterval { start: Ms, end: Ms },
    /// Overlaps the committed reservation with this id.
    SchedulingConflict(Ulid),
    /// Reservation does not exist.
    NotFound(Ulid),
    /// Caller does not own the reservation.
    Forbidden(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::InvalidInterval { start, end } => {
                write!(f, "end_time must be after start_time (start={start}, end={end})")
            }
            EngineError::SchedulingConflict(id) => {
                write!(f, "room is already booked for this time period (conflicts with {id})")
            }
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::Forbidden(id) => write!(f, "not authorized to access booking {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
