use ulid::Ulid;

use crate::model::{BookingStatus, DateRange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Empty, inverted, past or out-of-horizon range.
    DateRangeInvalid(&'static str),
    CapacityExceeded { requested: u32, capacity: u32 },
    /// Part of the requested range is taken. `booking` names the holder when a
    /// local booking is responsible; blocked nights carry `None`.
    SlotConflict {
        range: DateRange,
        booking: Option<Ulid>,
    },
    PropertyInactive(Ulid),
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    NotPendingApproval(Ulid),
    Forbidden(&'static str),
    /// The idempotency key was already used for a different request.
    IdempotencyKeyReused(String),
    HasBookings(Ulid),
    Timeout,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Conflicts are worth retrying with a different range; everything else is not.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::SlotConflict { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DateRangeInvalid(why) => write!(f, "invalid date range: {why}"),
            EngineError::CapacityExceeded { requested, capacity } => {
                write!(f, "{requested} guests exceed capacity {capacity}")
            }
            EngineError::SlotConflict { range, booking: Some(id) } => {
                write!(f, "slot conflict: {range} is held by booking {id}")
            }
            EngineError::SlotConflict { range, booking: None } => {
                write!(f, "slot conflict: {range} is blocked")
            }
            EngineError::PropertyInactive(id) => write!(f, "property {id} is not accepting bookings"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot move from {from} to {to}")
            }
            EngineError::NotPendingApproval(id) => {
                write!(f, "booking {id} is not pending approval")
            }
            EngineError::Forbidden(what) => write!(f, "forbidden: {what}"),
            EngineError::IdempotencyKeyReused(key) => {
                write!(f, "idempotency key {key:?} was used for a different booking request")
            }
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete property {id}: it has bookings")
            }
            EngineError::Timeout => write!(f, "timed out waiting for the property calendar"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
