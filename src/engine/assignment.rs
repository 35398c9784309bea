use chrono::NaiveTime;
use ulid::Ulid;

use crate::model::Slot;

use super::availability::is_slot_available;

/// How an "any staff" booking picks among the free staff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentPolicy {
    /// Lowest staff id that is free. Deterministic and easy to audit.
    #[default]
    FirstFit,
    /// Fewest occupying bookings that day; ties go to the lowest id.
    LeastBooked,
}

impl AssignmentPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "first_fit" => Some(AssignmentPolicy::FirstFit),
            "least_booked" => Some(AssignmentPolicy::LeastBooked),
            _ => None,
        }
    }
}

/// One staff member's view of the requested day.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub staff_id: Ulid,
    pub slots: Vec<Slot>,
    /// The full booking span (not just the first slot) is free and within
    /// hours.
    pub span_fits: bool,
    pub booked_that_day: usize,
}

impl Candidate {
    fn qualifies(&self, time: NaiveTime) -> bool {
        self.span_fits && is_slot_available(&self.slots, time)
    }
}

/// Pick a staff member for `time`, or `None` when nobody qualifies.
pub fn select_staff(
    candidates: &[Candidate],
    time: NaiveTime,
    policy: AssignmentPolicy,
) -> Option<Ulid> {
    let qualified = candidates.iter().filter(|c| c.qualifies(time));
    match policy {
        AssignmentPolicy::FirstFit => qualified.map(|c| c.staff_id).min(),
        AssignmentPolicy::LeastBooked => qualified
            .min_by_key(|c| (c.booked_that_day, c.staff_id))
            .map(|c| c.staff_id),
    }
}
