use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::assignment::{select_staff, Candidate};
use super::availability::{staff_slots, union_slots};
use super::conflict::{booking_span, check_no_conflict};
use super::{Engine, EngineError};

fn staff_info(ss: &StaffState) -> StaffInfo {
    StaffInfo {
        id: ss.id,
        name: ss.name.clone(),
        active: ss.active,
        granularity_min: ss.granularity_min,
        hours: ss.hours.clone(),
    }
}

impl Engine {
    pub async fn get_staff(&self, id: Ulid) -> Result<StaffInfo, EngineError> {
        let shared = self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = shared.read().await;
        Ok(staff_info(&guard))
    }

    /// All staff, active or not, ascending by id.
    pub async fn list_staff(&self) -> Vec<StaffInfo> {
        let mut out = Vec::with_capacity(self.state.len());
        for shared in self.staff_snapshot() {
            out.push(staff_info(&*shared.read().await));
        }
        out
    }

    /// Ids of staff currently taking bookings, ascending.
    pub async fn active_staff_ids(&self) -> Vec<Ulid> {
        let mut ids = Vec::new();
        for shared in self.staff_snapshot() {
            let guard = shared.read().await;
            if guard.active {
                ids.push(guard.id);
            }
        }
        ids
    }

    /// Sorted by staff id. Arcs are cloned out so no map shard guard is held
    /// across an await.
    pub(super) fn staff_snapshot(&self) -> Vec<super::SharedStaffState> {
        let mut entries: Vec<(Ulid, super::SharedStaffState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, s)| s).collect()
    }

    /// Commitments that hold time on `date` for one staff member, by start.
    pub async fn active_commitments(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Commitment>, EngineError> {
        let shared = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = shared.read().await;
        let day = self.config.clock.day_span(date);
        Ok(guard.occupying(&day).cloned().collect())
    }

    /// Every booking touching `date` for one staff member, any status.
    pub async fn list_bookings(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Commitment>, EngineError> {
        let shared = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = shared.read().await;
        let day = self.config.clock.day_span(date);
        Ok(guard.overlapping(&day).cloned().collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Commitment, EngineError> {
        let staff_id = self.staff_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let shared = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = shared.read().await;
        guard
            .commitments
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub fn get_service(&self, id: Ulid) -> Result<Service, EngineError> {
        self.services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn list_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn get_customer(&self, id: Ulid) -> Result<Customer, EngineError> {
        self.customers
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Look up every requested service and total duration and price.
    /// Repeats are allowed and counted each time.
    pub fn resolve_line_items(&self, ids: &[Ulid]) -> Result<LineItems, EngineError> {
        if ids.is_empty() {
            return Err(EngineError::invalid("a booking needs at least one service"));
        }
        if ids.len() > MAX_SERVICES_PER_BOOKING {
            return Err(EngineError::invalid(format!(
                "at most {MAX_SERVICES_PER_BOOKING} services per booking"
            )));
        }
        let mut services = Vec::with_capacity(ids.len());
        let mut duration_min: u32 = 0;
        let mut total_price: i64 = 0;
        for id in ids {
            let service = self
                .services
                .get(id)
                .map(|s| s.value().clone())
                .ok_or_else(|| EngineError::invalid(format!("unknown service {id}")))?;
            duration_min = duration_min
                .checked_add(service.duration_min)
                .ok_or_else(|| EngineError::invalid("total duration overflows"))?;
            total_price = total_price
                .checked_add(service.price)
                .ok_or_else(|| EngineError::invalid("total price overflows"))?;
            services.push(service);
        }
        Ok(LineItems {
            services,
            duration_min,
            total_price,
        })
    }

    /// Slot list for one staff member or the union across active staff.
    pub async fn resolve_slots(
        &self,
        selector: StaffSelector,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let clock = self.config.clock;
        match selector {
            StaffSelector::Specific(id) => {
                let shared = self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?;
                let guard = shared.read().await;
                if !guard.active {
                    return Ok(Vec::new());
                }
                Ok(staff_slots(&guard, date, &clock))
            }
            StaffSelector::Any => {
                let mut per_staff = Vec::new();
                for shared in self.staff_snapshot() {
                    let guard = shared.read().await;
                    if guard.active {
                        per_staff.push(staff_slots(&guard, date, &clock));
                    }
                }
                Ok(union_slots(per_staff))
            }
        }
    }

    /// Pick a staff member for an "any staff" booking of `duration_min`.
    ///
    /// Read locks only; the pick is advisory and the commit re-checks under
    /// the write lock.
    pub async fn select_staff_for(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        duration_min: u32,
    ) -> Result<Ulid, EngineError> {
        let clock = self.config.clock;
        let day = clock.day_span(date);
        let mut candidates = Vec::new();
        for shared in self.staff_snapshot() {
            let guard = shared.read().await;
            if !guard.active {
                continue;
            }
            let span_fits = booking_span(
                &guard,
                date,
                time,
                duration_min,
                &clock,
                self.config.allow_closing_overrun,
            )
            .and_then(|span| check_no_conflict(&guard, &span))
            .is_ok();
            candidates.push(Candidate {
                staff_id: guard.id,
                slots: staff_slots(&guard, date, &clock),
                span_fits,
                booked_that_day: guard.occupying(&day).count(),
            });
        }
        select_staff(&candidates, time, self.config.policy).ok_or_else(|| {
            metrics::counter!(crate::observability::NO_CAPACITY_TOTAL).increment(1);
            EngineError::NoCapacity { date, time }
        })
    }
}
