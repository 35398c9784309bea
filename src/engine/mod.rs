mod assignment;
mod availability;
mod conflict;
mod error;
mod mutations;
mod overlap;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use assignment::{select_staff, AssignmentPolicy, Candidate};
pub use availability::{is_slot_available, staff_slots, union_slots};
pub use error::EngineError;
pub use overlap::filter_slots;
pub use slots::generate_slots;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::BookingNotifier;
use crate::wal::Wal;

pub type SharedStaffState = Arc<RwLock<StaffState>>;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// Engine-facing scheduling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingConfig {
    pub clock: BusinessClock,
    /// Status new bookings start in: `Confirmed` or `Pending`.
    pub initial_status: BookingStatus,
    pub policy: AssignmentPolicy,
    /// Accept bookings that run past closing time.
    pub allow_closing_overrun: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            clock: BusinessClock::utc(),
            initial_status: BookingStatus::Confirmed,
            policy: AssignmentPolicy::FirstFit,
            allow_closing_overrun: false,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while one fsync is in progress are
/// written together and share the next fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    let result = result.and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Every caller hears about the failure, so none of the batch may
        // survive on disk.
        warn!(events = batch.len(), "WAL batch failed: {e}");
        if let Err(rollback) = wal.rollback_uncommitted() {
            error!("WAL rollback failed, retrying before the next append: {rollback}");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

/// In-memory scheduling state for one salon, rebuilt from the WAL at start.
///
/// Every staff member has their own lock. Bookings for different staff
/// never wait on each other; two bookings for the same staff member are
/// serialized and the second one sees the first.
pub struct Engine {
    pub state: DashMap<Ulid, SharedStaffState>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) customers: DashMap<Ulid, Customer>,
    /// Reverse lookup: booking id → staff id.
    pub(super) booking_to_staff: DashMap<Ulid, Ulid>,
    /// Booking ids claimed by a commit that has not finished yet.
    pub(super) booking_ids_in_flight: DashMap<Ulid, ()>,
    /// Idempotency key → booking id. `None` while the first request is
    /// still being committed.
    pub(super) idempotency: DashMap<String, Option<Ulid>>,
    /// Serializes catalog writes and compaction.
    pub(super) admin_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    changes: broadcast::Sender<Event>,
    pub(super) notifier: Arc<dyn BookingNotifier>,
    pub config: SchedulingConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        config: SchedulingConfig,
        notifier: Arc<dyn BookingNotifier>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            services: DashMap::new(),
            customers: DashMap::new(),
            booking_to_staff: DashMap::new(),
            booking_ids_in_flight: DashMap::new(),
            idempotency: DashMap::new(),
            admin_lock: Mutex::new(()),
            wal_tx,
            changes: broadcast::channel(CHANGE_FEED_CAPACITY).0,
            notifier,
            config,
        };

        for event in &events {
            engine.replay_event(event);
        }
        info!(
            events = events.len(),
            staff = engine.state.len(),
            bookings = engine.booking_to_staff.len(),
            path = %wal_path.display(),
            "replayed WAL"
        );
        Ok(engine)
    }

    /// Replay runs before the engine is shared, so every lock is free.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::StaffCreated { id, name, granularity_min, active } => {
                let ss = StaffState::new(*id, name.clone(), *granularity_min, *active);
                self.state.insert(*id, Arc::new(RwLock::new(ss)));
            }
            Event::ServiceUpserted(_) | Event::ServiceRemoved { .. } | Event::CustomerRegistered(_) => {
                self.apply_catalog(event);
            }
            other => {
                let Some(staff_id) = other.staff_id() else { return };
                let Some(shared) = self.get_staff_state(&staff_id) else { return };
                if let Ok(mut guard) = shared.try_write() {
                    self.apply_to_staff(&mut guard, other);
                }
            }
        }
    }

    /// Apply an event to a staff member's state. The caller holds the lock.
    pub(super) fn apply_to_staff(&self, ss: &mut StaffState, event: &Event) {
        match event {
            Event::StaffUpdated { name, granularity_min, active, .. } => {
                ss.name = name.clone();
                ss.granularity_min = *granularity_min;
                ss.active = *active;
            }
            Event::HoursSet { weekday, hours, .. } => ss.hours.set(*weekday, *hours),
            Event::BookingCreated(commitment) => {
                self.booking_to_staff.insert(commitment.id, ss.id);
                if let Some(key) = &commitment.idempotency_key {
                    self.idempotency.insert(key.clone(), Some(commitment.id));
                }
                ss.insert_commitment(commitment.clone());
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(c) = ss.commitment_mut(*id) {
                    c.status = *status;
                }
            }
            // Staff creation lives at the map level; catalog events never
            // touch staff state.
            Event::StaffCreated { .. }
            | Event::ServiceUpserted(_)
            | Event::ServiceRemoved { .. }
            | Event::CustomerRegistered(_) => {}
        }
    }

    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ServiceUpserted(service) => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceRemoved { id } => {
                self.services.remove(id);
            }
            Event::CustomerRegistered(customer) => {
                self.customers.insert(customer.id, customer.clone());
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durable first, then visible: WAL append, apply, publish.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut StaffState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_staff(ss, event);
        self.publish(event);
        Ok(())
    }

    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        self.publish(event);
        Ok(())
    }

    pub(super) fn publish(&self, event: &Event) {
        // Nobody listening is fine.
        let _ = self.changes.send(event.clone());
    }

    /// Every applied event, in commit order per staff member.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.changes.subscribe()
    }

    pub fn get_staff_state(&self, id: &Ulid) -> Option<SharedStaffState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn staff_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_staff.get(booking_id).map(|e| *e.value())
    }

    /// Lookup booking → staff, acquire that staff member's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<StaffState>, EngineError> {
        let staff_id = self
            .staff_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let shared = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        Ok(shared.write_owned().await)
    }
}
