use chrono::{NaiveDate, NaiveTime};

use crate::model::*;

/// Flag each candidate start time against existing commitments.
///
/// A slot covers `[start, start + granularity)`. It is unavailable when that
/// interval intersects any commitment span; touching endpoints do not count.
/// `commitments` must already exclude cancelled and no-show bookings.
pub fn filter_slots(
    slots: &[NaiveTime],
    date: NaiveDate,
    granularity_min: u32,
    clock: &BusinessClock,
    commitments: &[Span],
) -> Vec<Slot> {
    slots
        .iter()
        .map(|&time| {
            let span = Span::from_minutes(clock.instant(date, time), granularity_min);
            Slot {
                time,
                available: !commitments.iter().any(|c| c.overlaps(&span)),
            }
        })
        .collect()
}

/// The window a day's slots can touch: first slot start to last slot end.
pub fn slot_window(
    slots: &[NaiveTime],
    date: NaiveDate,
    granularity_min: u32,
    clock: &BusinessClock,
) -> Option<Span> {
    let first = slots.first()?;
    let last = slots.last()?;
    let start = clock.instant(date, *first);
    let end = Span::from_minutes(clock.instant(date, *last), granularity_min).end;
    Some(Span::new(start, end))
}
