use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, PropertyState};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build a stay range, rejecting empty and inverted ones.
pub fn stay_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    DateRange::try_new(start, end).ok_or(EngineError::DateRangeInvalid("check-in must be before check-out"))
}

/// A stay must start today or later, end inside the horizon, and not be absurdly long.
pub(crate) fn validate_stay(range: &DateRange, now: Ms, horizon_days: i64) -> Result<(), EngineError> {
    let today = day_of(now);
    if range.start < today {
        return Err(EngineError::DateRangeInvalid("check-in is in the past"));
    }
    let horizon = today
        .checked_add_days(Days::new(horizon_days.max(0) as u64))
        .unwrap_or(NaiveDate::MAX);
    if range.end > horizon {
        return Err(EngineError::DateRangeInvalid("check-out is beyond the booking horizon"));
    }
    if range.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn validate_window(range: &DateRange) -> Result<(), EngineError> {
    if range.nights() > MAX_QUERY_NIGHTS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Active bookings overlapping `range`, in start order.
pub fn blocking_bookings<'a>(ps: &'a PropertyState, range: &DateRange) -> Vec<&'a Booking> {
    ps.overlapping_bookings(range)
        .filter(|b| b.status.is_active())
        .collect()
}

/// Whether any active booking other than `exclude` overlaps `range`.
pub fn overlaps(ps: &PropertyState, range: &DateRange, exclude: Option<Ulid>) -> bool {
    ps.overlapping_bookings(range)
        .any(|b| b.status.is_active() && Some(b.id) != exclude)
}

/// Can `range` be booked right now? Must be called under the property's write
/// lock for the answer to hold until commit.
///
/// Bookings are reported before blocks so the caller learns who holds the nights.
pub fn check_bookable(ps: &PropertyState, range: &DateRange) -> Result<(), EngineError> {
    if let Some(holder) = blocking_bookings(ps, range).first() {
        return Err(EngineError::SlotConflict {
            range: holder.range.intersection(range).unwrap_or(*range),
            booking: Some(holder.id),
        });
    }
    if let Some(blocked) = ps.ranges_with_status(range, SlotStatus::Blocked).first() {
        return Err(EngineError::SlotConflict {
            range: *blocked,
            booking: None,
        });
    }
    Ok(())
}
