use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};

use crate::model::*;

use super::overlap::{filter_slots, slot_window};
use super::slots::generate_slots;

// ── Availability Algorithm ────────────────────────────────────────

/// Slot list for one staff member on one date.
///
/// Closed weekday → empty. Otherwise the generated start times are flagged
/// against the staff member's commitments that still occupy time.
pub fn staff_slots(staff: &StaffState, date: NaiveDate, clock: &BusinessClock) -> Vec<Slot> {
    let times = generate_slots(staff.hours.for_date(date), staff.granularity_min);
    let Some(window) = slot_window(&times, date, staff.granularity_min, clock) else {
        return Vec::new();
    };
    let busy: Vec<Span> = staff.occupying(&window).map(|c| c.span).collect();
    filter_slots(&times, date, staff.granularity_min, clock, &busy)
}

/// Merge per-staff slot lists into one "any staff" list.
///
/// Distinct times ascending; a time is available if at least one staff
/// member has it available. Staff with different granularities contribute
/// their own times.
pub fn union_slots<I>(per_staff: I) -> Vec<Slot>
where
    I: IntoIterator<Item = Vec<Slot>>,
{
    let mut merged: BTreeMap<NaiveTime, bool> = BTreeMap::new();
    for slots in per_staff {
        for slot in slots {
            let entry = merged.entry(slot.time).or_insert(false);
            *entry |= slot.available;
        }
    }
    merged
        .into_iter()
        .map(|(time, available)| Slot { time, available })
        .collect()
}

/// Whether `time` shows up in `slots` as available.
pub fn is_slot_available(slots: &[Slot], time: NaiveTime) -> bool {
    slots.iter().any(|s| s.time == time && s.available)
}
