use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_EMPLOYEE;
use crate::model::*;

use super::EngineError;

/// Half-open overlap check against an employee's calendar. Runs while the
/// caller holds the calendar lock, so the answer is authoritative for the
/// duration of the write. `exclude` skips the booking being rescheduled so
/// it doesn't conflict with itself.
pub(crate) fn check_no_conflict(
    cal: &Calendar,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match cal.conflict(span, exclude) {
        Some(existing) => Err(EngineError::Conflict(existing)),
        None => Ok(()),
    }
}

pub(crate) fn check_calendar_capacity(cal: &Calendar) -> Result<(), EngineError> {
    if cal.slots.len() >= MAX_BOOKINGS_PER_EMPLOYEE {
        return Err(EngineError::LimitExceeded("too many active bookings for employee"));
    }
    Ok(())
}
