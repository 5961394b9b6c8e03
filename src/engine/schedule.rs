use chrono::NaiveTime;
use ulid::Ulid;

use crate::model::ScheduleWindow;

use super::time::LocalStamp;
use super::EngineError;

/// Pick the schedule window the booking fits into. A window matches when the
/// service *starts* inside it (`from <= start <= to`, boundaries inclusive);
/// among matches, ordered by opening time, the first whose closing time also
/// accommodates the end wins — so split shifts (morning/afternoon windows)
/// resolve to the shift that actually contains the appointment.
///
/// A start with no matching window is `BusinessClosed`. A start that matches
/// but an end that doesn't — including an end on the next local calendar day,
/// which no same-day closing time can accommodate — is
/// `ClosesBeforeServiceEnds`, naming the most generous closing time on offer.
pub fn find_open_window<'a>(
    windows: &'a [ScheduleWindow],
    start: &LocalStamp,
    end: &LocalStamp,
) -> Result<&'a ScheduleWindow, EngineError> {
    let mut matching: Vec<&ScheduleWindow> = windows
        .iter()
        .filter(|w| w.weekday == start.weekday && w.from <= start.time && w.to >= start.time)
        .collect();
    if matching.is_empty() {
        return Err(EngineError::BusinessClosed {
            weekday: start.weekday,
            at: start.time,
        });
    }
    matching.sort_by_key(|w| w.from);

    if end.date == start.date
        && let Some(w) = matching.iter().find(|w| end.time <= w.to)
    {
        return Ok(w);
    }

    let closes = matching
        .iter()
        .map(|w| w.to)
        .max()
        .unwrap_or(start.time);
    Err(EngineError::ClosesBeforeServiceEnds {
        end: end.time,
        closes,
    })
}

/// Validate a new or updated window against its siblings on the same weekday.
/// Windows are half-open for this purpose: touching endpoints (a 09:00-13:00
/// and a 13:00-17:00 shift) are legal, intersecting interiors are not.
/// `exclude` skips the window being updated.
pub fn check_window_fits(
    windows: &[ScheduleWindow],
    weekday: u8,
    from: NaiveTime,
    to: NaiveTime,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if from >= to {
        return Err(EngineError::InvalidInput(
            "schedule start time must be before end time".into(),
        ));
    }
    for w in windows {
        if w.weekday != weekday || exclude == Some(w.id) {
            continue;
        }
        if from < w.to && w.from < to {
            return Err(EngineError::InvalidInput(format!(
                "window overlaps existing window {} [{}, {})",
                w.id,
                w.from.format("%H:%M"),
                w.to.format("%H:%M")
            )));
        }
    }
    Ok(())
}
