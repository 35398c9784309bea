use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only stored time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + minutes as Ms * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Intersection test; touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Business clock ───────────────────────────────────────────────

/// Converts between local salon wall-clock values and absolute instants.
/// One fixed offset for everything; no DST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessClock {
    offset: FixedOffset,
}

impl BusinessClock {
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    /// `None` if the offset is outside ±24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    pub fn instant(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        // A fixed offset never yields an ambiguous or missing local time.
        self.offset
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| date.and_time(time).and_utc().timestamp_millis())
    }

    /// The whole local day `[00:00, next 00:00)`.
    pub fn day_span(&self, date: NaiveDate) -> Span {
        let start = self.instant(date, NaiveTime::default());
        Span::new(start, start + 24 * 60 * MINUTE_MS)
    }

    pub fn local(&self, ms: Ms) -> Option<DateTime<FixedOffset>> {
        DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&self.offset))
    }

    pub fn local_date(&self, ms: Ms) -> Option<NaiveDate> {
        self.local(ms).map(|dt| dt.date_naive())
    }

    pub fn local_time(&self, ms: Ms) -> Option<NaiveTime> {
        self.local(ms).map(|dt| dt.time())
    }
}

impl Default for BusinessClock {
    fn default() -> Self {
        Self::utc()
    }
}

// ── Working hours ────────────────────────────────────────────────

/// Opening window for one weekday, local time. `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }
}

pub const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Monday-first table of opening windows. A `None` day is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    days: [Option<WorkingHours>; 7],
}

impl WeeklyHours {
    pub fn for_weekday(&self, day: Weekday) -> Option<WorkingHours> {
        self.days[day.num_days_from_monday() as usize]
    }

    pub fn for_date(&self, date: NaiveDate) -> Option<WorkingHours> {
        self.for_weekday(date.weekday())
    }

    pub fn set(&mut self, day: Weekday, hours: Option<WorkingHours>) {
        self.days[day.num_days_from_monday() as usize] = hours;
    }

    pub fn with(mut self, day: Weekday, hours: WorkingHours) -> Self {
        self.set(day, Some(hours));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (Weekday, WorkingHours)> + '_ {
        self.days.iter().enumerate().filter_map(|(i, h)| {
            h.map(|h| (WEEK[i], h))
        })
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Cancelled and no-show bookings free their time.
    pub fn occupies_time(self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::NoShow)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed | Cancelled | NoShow)
                | (Confirmed, CheckedIn | Cancelled | NoShow)
                | (CheckedIn, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "checked_in" => Some(BookingStatus::CheckedIn),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "no_show" => Some(BookingStatus::NoShow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// Who a booking is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerRef {
    Account(Ulid),
    Guest { id: Ulid, info: GuestInfo },
}

impl CustomerRef {
    pub fn id(&self) -> Ulid {
        match self {
            CustomerRef::Account(id) => *id,
            CustomerRef::Guest { id, .. } => *id,
        }
    }
}

/// Customer details supplied with a booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerInfo {
    Account(Ulid),
    Guest(GuestInfo),
}

/// A booking occupying a staff member's time. Staff and span never change
/// after creation; only `status` moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub customer: CustomerRef,
    pub span: Span,
    pub services: Vec<Ulid>,
    pub duration_min: u32,
    /// Minor currency units, frozen at commit time.
    pub total_price: i64,
    pub status: BookingStatus,
    pub idempotency_key: Option<String>,
    pub created_at: Ms,
}

impl Commitment {
    pub fn occupies_time(&self) -> bool {
        self.status.occupies_time()
    }
}

// ── Staff ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StaffState {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub granularity_min: u32,
    pub hours: WeeklyHours,
    /// Every commitment ever made for this staff member, sorted by `span.start`.
    pub commitments: Vec<Commitment>,
}

impl StaffState {
    pub fn new(id: Ulid, name: Option<String>, granularity_min: u32, active: bool) -> Self {
        Self {
            id,
            name,
            active,
            granularity_min,
            hours: WeeklyHours::default(),
            commitments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_commitment(&mut self, commitment: Commitment) {
        let pos = self
            .commitments
            .binary_search_by_key(&commitment.span.start, |c| c.span.start)
            .unwrap_or_else(|e| e);
        self.commitments.insert(pos, commitment);
    }

    pub fn commitment_mut(&mut self, id: Ulid) -> Option<&mut Commitment> {
        self.commitments.iter_mut().find(|c| c.id == id)
    }

    /// Commitments whose span overlaps `query`, regardless of status.
    /// Binary search skips those starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Commitment> {
        let right_bound = self
            .commitments
            .partition_point(|c| c.span.start < query.end);
        self.commitments[..right_bound]
            .iter()
            .filter(move |c| c.span.end > query.start)
    }

    /// Overlapping commitments that still hold their time.
    pub fn occupying(&self, query: &Span) -> impl Iterator<Item = &Commitment> {
        self.overlapping(query).filter(|c| c.occupies_time())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_min: u32,
    pub price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// A candidate start time. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub time: NaiveTime,
    pub available: bool,
}

// ── WAL records ──────────────────────────────────────────────────

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StaffCreated {
        id: Ulid,
        name: Option<String>,
        granularity_min: u32,
        active: bool,
    },
    StaffUpdated {
        id: Ulid,
        name: Option<String>,
        granularity_min: u32,
        active: bool,
    },
    HoursSet {
        staff_id: Ulid,
        weekday: Weekday,
        hours: Option<WorkingHours>,
    },
    ServiceUpserted(Service),
    ServiceRemoved {
        id: Ulid,
    },
    CustomerRegistered(Customer),
    BookingCreated(Commitment),
    BookingStatusChanged {
        id: Ulid,
        staff_id: Ulid,
        status: BookingStatus,
    },
}

impl Event {
    /// The staff member whose state this event mutates, if any.
    pub fn staff_id(&self) -> Option<Ulid> {
        match self {
            Event::StaffCreated { id, .. } | Event::StaffUpdated { id, .. } => Some(*id),
            Event::HoursSet { staff_id, .. } | Event::BookingStatusChanged { staff_id, .. } => {
                Some(*staff_id)
            }
            Event::BookingCreated(c) => Some(c.staff_id),
            Event::ServiceUpserted(_) | Event::ServiceRemoved { .. } | Event::CustomerRegistered(_) => {
                None
            }
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// Which staff a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffSelector {
    Any,
    Specific(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub staff: StaffSelector,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub services: Vec<Ulid>,
    pub customer: CustomerInfo,
    pub idempotency_key: Option<String>,
}

/// Services resolved for one booking, with totals frozen at lookup time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItems {
    pub services: Vec<Service>,
    pub duration_min: u32,
    pub total_price: i64,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub granularity_min: u32,
    pub hours: WeeklyHours,
}
