use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::limits::*;
use crate::model::Ms;

use super::EngineError;

/// A UTC instant rendered in a business's zone: the local weekday
/// (0 = Sunday … 6 = Saturday), calendar date, and wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStamp {
    pub weekday: u8,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

pub fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::InvalidInput(format!(
            "timestamp {t} outside the valid range [2000-01-01, 2100-01-01)"
        )));
    }
    Ok(())
}

pub fn parse_zone(s: &str) -> Result<Tz, EngineError> {
    if s.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone name too long"));
    }
    s.parse::<Tz>()
        .map_err(|_| EngineError::InvalidInput(format!("unknown timezone: {s}")))
}

/// Parse a wall-clock "HH:MM" string as used by schedule windows.
pub fn parse_clock(s: &str) -> Result<NaiveTime, EngineError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| EngineError::InvalidInput(format!("invalid time '{s}', expected HH:MM")))
}

/// Render an instant in the target zone via the tz database. DST and offset
/// shifts move both the date and the time-of-day, so this must never be
/// replaced by naive offset arithmetic.
pub fn normalize(instant: Ms, tz: Tz) -> Result<LocalStamp, EngineError> {
    let utc = Utc
        .timestamp_millis_opt(instant)
        .single()
        .ok_or_else(|| EngineError::InvalidInput(format!("unrepresentable timestamp: {instant}")))?;
    let local = utc.with_timezone(&tz);
    Ok(LocalStamp {
        weekday: local.weekday().num_days_from_sunday() as u8,
        date: local.date_naive(),
        time: local.time(),
    })
}

/// End instant of a service started at `start`. Always recomputed here —
/// never trusted from the caller.
pub fn end_of(start: Ms, duration_min: i64) -> Ms {
    start + duration_min * 60_000
}
