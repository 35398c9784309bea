use std::sync::Arc;

use chrono::Weekday;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{booking_span, check_no_conflict, now_ms};
use super::{Engine, EngineError, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_granularity(granularity_min: u32) -> Result<(), EngineError> {
    if !(MIN_GRANULARITY_MIN..=MAX_GRANULARITY_MIN).contains(&granularity_min) {
        return Err(EngineError::invalid(format!(
            "granularity must be between {MIN_GRANULARITY_MIN} and {MAX_GRANULARITY_MIN} minutes"
        )));
    }
    Ok(())
}

fn check_guest(info: &GuestInfo) -> Result<(), EngineError> {
    if info.name.trim().is_empty() {
        return Err(EngineError::invalid("guest name is required"));
    }
    check_len(&info.name, MAX_NAME_LEN, "guest name too long")?;
    for contact in [&info.phone, &info.email].into_iter().flatten() {
        check_len(contact, MAX_CONTACT_LEN, "guest contact too long")?;
    }
    Ok(())
}

impl Engine {
    // ── Staff ────────────────────────────────────────────

    pub async fn create_staff(
        &self,
        id: Ulid,
        name: Option<String>,
        granularity_min: u32,
        active: bool,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name {
            check_len(n, MAX_NAME_LEN, "staff name too long")?;
        }
        check_granularity(granularity_min)?;

        let _admin = self.admin_lock.lock().await;
        if self.state.len() >= MAX_STAFF {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::StaffCreated { id, name: name.clone(), granularity_min, active };
        self.wal_append(&event).await?;
        let ss = StaffState::new(id, name, granularity_min, active);
        self.state.insert(id, Arc::new(RwLock::new(ss)));
        self.publish(&event);
        info!(staff = %id, "staff created");
        Ok(())
    }

    pub async fn update_staff(
        &self,
        id: Ulid,
        name: Option<String>,
        granularity_min: u32,
        active: bool,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name {
            check_len(n, MAX_NAME_LEN, "staff name too long")?;
        }
        check_granularity(granularity_min)?;
        let shared = self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = shared.write().await;
        let event = Event::StaffUpdated { id, name, granularity_min, active };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Inactive staff keep their bookings but drop out of browsing and
    /// assignment.
    pub async fn set_staff_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let shared = self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = shared.write().await;
        let event = Event::StaffUpdated {
            id,
            name: guard.name.clone(),
            granularity_min: guard.granularity_min,
            active,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// `None` closes the weekday. Existing bookings are left alone.
    pub async fn set_working_hours(
        &self,
        staff_id: Ulid,
        weekday: Weekday,
        hours: Option<WorkingHours>,
    ) -> Result<(), EngineError> {
        let shared = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let mut guard = shared.write().await;
        let event = Event::HoursSet { staff_id, weekday, hours };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Catalog ──────────────────────────────────────────

    /// Price changes never touch existing bookings; their totals are frozen.
    pub async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        if service.name.trim().is_empty() {
            return Err(EngineError::invalid("service name is required"));
        }
        check_len(&service.name, MAX_NAME_LEN, "service name too long")?;
        if service.duration_min == 0 || service.duration_min > MAX_SERVICE_DURATION_MIN {
            return Err(EngineError::invalid(format!(
                "service duration must be between 1 and {MAX_SERVICE_DURATION_MIN} minutes"
            )));
        }
        if service.price < 0 {
            return Err(EngineError::invalid("service price cannot be negative"));
        }

        let _admin = self.admin_lock.lock().await;
        if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        self.persist_catalog(&Event::ServiceUpserted(service)).await
    }

    pub async fn remove_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _admin = self.admin_lock.lock().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::ServiceRemoved { id }).await
    }

    pub async fn register_customer(&self, customer: Customer) -> Result<(), EngineError> {
        if customer.name.trim().is_empty() {
            return Err(EngineError::invalid("customer name is required"));
        }
        check_len(&customer.name, MAX_NAME_LEN, "customer name too long")?;
        for contact in [&customer.phone, &customer.email].into_iter().flatten() {
            check_len(contact, MAX_CONTACT_LEN, "customer contact too long")?;
        }

        let _admin = self.admin_lock.lock().await;
        if self.customers.contains_key(&customer.id) {
            return Err(EngineError::AlreadyExists(customer.id));
        }
        if self.customers.len() >= MAX_CUSTOMERS {
            return Err(EngineError::LimitExceeded("too many customers"));
        }
        self.persist_catalog(&Event::CustomerRegistered(customer)).await
    }

    // ── Bookings ─────────────────────────────────────────

    /// Entry point for a customer booking: dedupe on the idempotency key,
    /// pick staff for "any", then commit.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Commitment, EngineError> {
        let Some(key) = req.idempotency_key.clone() else {
            return self.place_booking(&req).await;
        };
        check_len(&key, MAX_IDEMPOTENCY_KEY_LEN, "idempotency key too long")?;

        let seen = match self.idempotency.entry(key.clone()) {
            Entry::Occupied(e) => Some(*e.get()),
            Entry::Vacant(v) => {
                v.insert(None);
                None
            }
        };
        match seen {
            Some(Some(existing)) => {
                let booking = self.get_booking(existing).await?;
                if !self.same_booking(&req, &booking) {
                    return Err(EngineError::invalid(format!(
                        "idempotency key {key:?} was already used for a different booking"
                    )));
                }
                debug!(booking = %existing, %key, "idempotent replay");
                return Ok(booking);
            }
            Some(None) => return Err(EngineError::DuplicateRequest(key)),
            None => {}
        }

        let result = self.place_booking(&req).await;
        if result.is_err() {
            self.idempotency.remove_if(&key, |_, v| v.is_none());
        }
        result
    }

    /// A retry must ask for the same staff, start and services as the
    /// booking its key already produced. "Any staff" matches whoever was
    /// assigned.
    fn same_booking(&self, req: &BookingRequest, booking: &Commitment) -> bool {
        let staff_matches = match req.staff {
            StaffSelector::Specific(id) => id == booking.staff_id,
            StaffSelector::Any => true,
        };
        staff_matches
            && req.services == booking.services
            && self.config.clock.instant(req.date, req.time) == booking.span.start
    }

    async fn place_booking(&self, req: &BookingRequest) -> Result<Commitment, EngineError> {
        let staff_id = match req.staff {
            StaffSelector::Specific(id) => id,
            StaffSelector::Any => {
                let items = self.resolve_line_items(&req.services)?;
                self.select_staff_for(req.date, req.time, items.duration_min)
                    .await?
            }
        };
        self.commit_booking(staff_id, req).await
    }

    /// Commit a booking against one staff member.
    ///
    /// Everything that can be decided without the staff lock (services,
    /// customer, totals) is decided first. Hours, closing time and overlap
    /// are checked under the write lock, so of two racing commits for
    /// overlapping time exactly one wins.
    pub async fn commit_booking(
        &self,
        staff_id: Ulid,
        req: &BookingRequest,
    ) -> Result<Commitment, EngineError> {
        let items = self.resolve_line_items(&req.services)?;
        let customer = match &req.customer {
            CustomerInfo::Account(id) => {
                if !self.customers.contains_key(id) {
                    return Err(EngineError::NotFound(*id));
                }
                CustomerRef::Account(*id)
            }
            CustomerInfo::Guest(info) => {
                check_guest(info)?;
                CustomerRef::Guest { id: Ulid::new(), info: info.clone() }
            }
        };
        let _claim = self.claim_booking_id(req.id)?;

        let shared = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let mut guard = shared.write().await;
        if guard.commitments.len() >= MAX_COMMITMENTS_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many bookings for staff"));
        }
        let span = booking_span(
            &guard,
            req.date,
            req.time,
            items.duration_min,
            &self.config.clock,
            self.config.allow_closing_overrun,
        )?;
        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!(staff = %staff_id, booking = %req.id, "booking lost the race: {e}");
            return Err(e);
        }

        let commitment = Commitment {
            id: req.id,
            staff_id,
            customer,
            span,
            services: items.services.iter().map(|s| s.id).collect(),
            duration_min: items.duration_min,
            total_price: items.total_price,
            status: self.config.initial_status,
            idempotency_key: req.idempotency_key.clone(),
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &Event::BookingCreated(commitment.clone()))
            .await?;
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(booking = %commitment.id, staff = %staff_id, "booking committed");
        self.spawn_notification(commitment.clone());
        Ok(commitment)
    }

    /// Reserve a booking id until the commit holding it finishes.
    ///
    /// Staff locks only serialize commits for one staff member, so two
    /// commits carrying the same id for different staff meet here instead.
    /// The id is committed to `booking_to_staff` before the claim drops.
    fn claim_booking_id(&self, id: Ulid) -> Result<BookingIdClaim<'_>, EngineError> {
        match self.booking_ids_in_flight.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                if self.booking_to_staff.contains_key(&id) {
                    return Err(EngineError::AlreadyExists(id));
                }
                v.insert(());
                Ok(BookingIdClaim { engine: self, id })
            }
        }
    }

    fn spawn_notification(&self, commitment: Commitment) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.booking_created(&commitment.customer, &commitment).await {
                warn!(booking = %commitment.id, "booking notification failed: {e}");
            }
        });
    }

    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Commitment, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let current = guard
            .commitments
            .iter()
            .find(|c| c.id == id)
            .ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::invalid(format!(
                "booking cannot move from {} to {}",
                current.status.as_str(),
                status.as_str()
            )));
        }
        let event = Event::BookingStatusChanged { id, staff_id: guard.id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .commitments
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Cancelling frees the booking's time immediately.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Commitment, EngineError> {
        self.set_booking_status(id, BookingStatus::Cancelled).await
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild current state.
    ///
    /// Holds the admin lock and a read lock on every staff member for the
    /// whole rewrite so no commit lands between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin_lock.lock().await;

        let mut events = Vec::new();
        for service in self.list_services() {
            events.push(Event::ServiceUpserted(service));
        }
        let mut customers: Vec<Customer> =
            self.customers.iter().map(|c| c.value().clone()).collect();
        customers.sort_by_key(|c| c.id);
        events.extend(customers.into_iter().map(Event::CustomerRegistered));

        let mut guards = Vec::new();
        for shared in self.staff_snapshot() {
            guards.push(shared.read_owned().await);
        }
        for ss in &guards {
            events.push(Event::StaffCreated {
                id: ss.id,
                name: ss.name.clone(),
                granularity_min: ss.granularity_min,
                active: ss.active,
            });
            for (weekday, hours) in ss.hours.iter() {
                events.push(Event::HoursSet { staff_id: ss.id, weekday, hours: Some(hours) });
            }
            for commitment in &ss.commitments {
                events.push(Event::BookingCreated(commitment.clone()));
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Releases a claimed booking id on every exit from `commit_booking`,
/// including a dropped future.
struct BookingIdClaim<'a> {
    engine: &'a Engine,
    id: Ulid,
}

impl Drop for BookingIdClaim<'_> {
    fn drop(&mut self) {
        self.engine.booking_ids_in_flight.remove(&self.id);
    }
}
