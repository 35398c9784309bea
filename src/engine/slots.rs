use chrono::{NaiveTime, TimeDelta};

use crate::model::WorkingHours;

/// Candidate start times for one day: `start`, `start + g`, ... while
/// strictly before `end`. A closed day (`None`) yields nothing.
///
/// Only start times are emitted; whether a longer booking fits before
/// closing is the committer's concern.
pub fn generate_slots(hours: Option<WorkingHours>, granularity_min: u32) -> Vec<NaiveTime> {
    let Some(hours) = hours else {
        return Vec::new();
    };
    if granularity_min == 0 {
        return Vec::new();
    }
    let step = TimeDelta::minutes(granularity_min as i64);

    let mut slots = Vec::new();
    let mut t = hours.start;
    while t < hours.end {
        slots.push(t);
        let (next, wrapped) = t.overflowing_add_signed(step);
        // Stepping past midnight ends the day.
        if wrapped != 0 {
            break;
        }
        t = next;
    }
    slots
}
