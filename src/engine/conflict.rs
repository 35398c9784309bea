use chrono::{Datelike, NaiveDate, NaiveTime};

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Place a booking of `duration_min` at `date`/`time` on the staff
/// member's calendar. Checks the day is open, the start is within hours
/// and, unless `allow_overrun`, that the booking ends by closing time.
pub(crate) fn booking_span(
    staff: &StaffState,
    date: NaiveDate,
    time: NaiveTime,
    duration_min: u32,
    clock: &BusinessClock,
    allow_overrun: bool,
) -> Result<Span, EngineError> {
    if !staff.active {
        return Err(EngineError::invalid(format!(
            "staff {} is not taking bookings",
            staff.id
        )));
    }
    let hours = staff.hours.for_date(date).ok_or_else(|| {
        EngineError::invalid(format!("staff {} does not work on {}", staff.id, date.weekday()))
    })?;
    if !hours.contains(time) {
        return Err(EngineError::invalid(format!(
            "{} is outside working hours {}-{}",
            time.format("%H:%M"),
            hours.start.format("%H:%M"),
            hours.end.format("%H:%M"),
        )));
    }
    let span = Span::from_minutes(clock.instant(date, time), duration_min);
    if !allow_overrun && span.end > clock.instant(date, hours.end) {
        return Err(EngineError::invalid(format!(
            "{duration_min} min booking at {} runs past closing time {}",
            time.format("%H:%M"),
            hours.end.format("%H:%M"),
        )));
    }
    Ok(span)
}

/// Any commitment still holding time inside `span` is a conflict.
pub(crate) fn check_no_conflict(staff: &StaffState, span: &Span) -> Result<(), EngineError> {
    match staff.occupying(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
