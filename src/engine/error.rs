use ulid::Ulid;

use crate::model::{BookingStatus, Ms, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidWindow { start: Ms, end: Ms },
    PastBooking { start: Ms, now: Ms },
    DurationExceeded { duration: Ms, max: Ms },
    RoomNotFound(Ulid),
    RoomUnavailable(Ulid),
    SlotConflict { booking_id: Ulid, span: Span },
    UserOverlap { booking_id: Ulid, span: Span },
    Forbidden(&'static str),
    NotFound(Ulid),
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    AlreadyExists(Ulid),
    NameTaken(String),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    PersistenceFailure(String),
    PersistenceTimeout,
}

impl EngineError {
    /// Stable short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidWindow { .. } => "invalid_window",
            EngineError::PastBooking { .. } => "past_booking",
            EngineError::DurationExceeded { .. } => "duration_exceeded",
            EngineError::RoomNotFound(_) => "room_not_found",
            EngineError::RoomUnavailable(_) => "room_unavailable",
            EngineError::SlotConflict { .. } => "slot_conflict",
            EngineError::UserOverlap { .. } => "user_overlap",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NameTaken(_) => "name_taken",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::PersistenceFailure(_) => "persistence_failure",
            EngineError::PersistenceTimeout => "persistence_timeout",
        }
    }

    /// The outcome of the operation is unknown and the caller may retry it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PersistenceTimeout)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window: start {start} is not before end {end}")
            }
            EngineError::PastBooking { start, now } => {
                write!(f, "cannot book in the past: start {start} < now {now}")
            }
            EngineError::DurationExceeded { duration, max } => {
                write!(f, "booking duration {duration}ms exceeds maximum {max}ms")
            }
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::RoomUnavailable(id) => write!(f, "room {id} is under maintenance"),
            EngineError::SlotConflict { booking_id, span } => {
                write!(f, "slot conflicts with booking {booking_id} {span}")
            }
            EngineError::UserOverlap { booking_id, span } => {
                write!(f, "user already holds overlapping booking {booking_id} {span}")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NameTaken(name) => write!(f, "room name already in use: {name}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::PersistenceFailure(e) => write!(f, "persistence failure: {e}"),
            EngineError::PersistenceTimeout => {
                write!(f, "persistence timed out; outcome unknown, retry")
            }
        }
    }
}

impl std::error::Error for EngineError {}
