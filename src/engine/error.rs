use chrono::NaiveTime;
use ulid::Ulid;

use crate::model::{weekday_name, BookingStatus};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input caught before any lookup: bad timestamps, unknown
    /// zones/roles/statuses, non-positive durations, out-of-range weekdays.
    InvalidInput(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// No schedule window matches the requested local start time.
    BusinessClosed { weekday: u8, at: NaiveTime },
    /// A window matched the start, but the service runs past its closing time.
    ClosesBeforeServiceEnds { end: NaiveTime, closes: NaiveTime },
    /// Requested employee doesn't exist, isn't an EMPLOYEE, or belongs to a
    /// different business.
    EmployeeNotInBusiness(Ulid),
    /// Requested employee has an overlapping non-cancelled booking.
    EmployeeUnavailable(Ulid),
    /// Auto-assignment found nobody free (including the no-employees case).
    NoAvailableEmployee,
    /// Retryable: a racing writer claimed the slot between resolution and the
    /// calendar lock, or an expected-status precondition no longer holds.
    Conflict(Ulid),
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::BusinessClosed { weekday, at } => {
                write!(
                    f,
                    "business is closed on {} at {}",
                    weekday_name(*weekday),
                    at.format("%H:%M")
                )
            }
            EngineError::ClosesBeforeServiceEnds { end, closes } => {
                write!(
                    f,
                    "service would end at {}, after business closing time ({})",
                    end.format("%H:%M"),
                    closes.format("%H:%M")
                )
            }
            EngineError::EmployeeNotInBusiness(id) => {
                write!(f, "employee {id} not found in this business")
            }
            EngineError::EmployeeUnavailable(id) => {
                write!(f, "employee {id} is not available in the requested interval")
            }
            EngineError::NoAvailableEmployee => {
                write!(f, "no employee is available for the requested interval")
            }
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(
                    f,
                    "invalid status transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
