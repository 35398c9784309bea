use super::*;
use crate::notify::{BroadcastNotifier, NotifyError};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Weekday};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_test::assert_ok;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chairtime_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// 2026-10-19 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn hours(open: NaiveTime, close: NaiveTime) -> Option<WorkingHours> {
    WorkingHours::new(open, close)
}

fn engine_with(name: &str, config: SchedulingConfig) -> Engine {
    Engine::new(test_wal_path(name), config, Arc::new(BroadcastNotifier::new())).unwrap()
}

fn engine(name: &str) -> Engine {
    engine_with(name, SchedulingConfig::default())
}

/// Staff working Monday `open..close` at the given granularity.
async fn add_staff(engine: &Engine, id: Ulid, granularity: u32, open: NaiveTime, close: NaiveTime) {
    engine.create_staff(id, None, granularity, true).await.unwrap();
    engine
        .set_working_hours(id, Weekday::Mon, hours(open, close))
        .await
        .unwrap();
}

async fn add_service(engine: &Engine, duration_min: u32, price: i64) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_service(Service { id, name: format!("{duration_min}m"), duration_min, price })
        .await
        .unwrap();
    id
}

fn guest() -> CustomerInfo {
    CustomerInfo::Guest(GuestInfo {
        name: "Ada".into(),
        phone: Some("+44 20 7946 0000".into()),
        email: None,
    })
}

fn request(staff: StaffSelector, time: NaiveTime, services: Vec<Ulid>) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        staff,
        date: monday(),
        time,
        services,
        customer: guest(),
        idempotency_key: None,
    }
}

fn available_times(slots: &[Slot]) -> Vec<NaiveTime> {
    slots.iter().filter(|s| s.available).map(|s| s.time).collect()
}

// ── Staff & catalog ──────────────────────────────────────

#[tokio::test]
async fn create_and_get_staff() {
    let engine = engine("create_staff.wal");
    let id = Ulid::new();
    engine.create_staff(id, Some("Mia".into()), 30, true).await.unwrap();

    let info = engine.get_staff(id).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("Mia"));
    assert_eq!(info.granularity_min, 30);
    assert!(info.active);
    assert!(info.hours.iter().next().is_none());
}

#[tokio::test]
async fn duplicate_staff_rejected() {
    let engine = engine("dup_staff.wal");
    let id = Ulid::new();
    engine.create_staff(id, None, 30, true).await.unwrap();
    let result = engine.create_staff(id, None, 30, true).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(x)) if x == id));
}

#[tokio::test]
async fn update_staff_changes_grid() {
    let engine = engine("update_staff.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;

    engine.update_staff(sid, Some("Mia".into()), 60, true).await.unwrap();
    let info = engine.get_staff(sid).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("Mia"));
    assert_eq!(info.granularity_min, 60);

    let slots = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert_eq!(available_times(&slots), vec![t(10, 0), t(11, 0)]);

    let result = engine.update_staff(sid, None, 3, true).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    let result = engine.update_staff(Ulid::new(), None, 30, true).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn granularity_out_of_range_rejected() {
    let engine = engine("bad_granularity.wal");
    for g in [0, 4, 241] {
        let result = engine.create_staff(Ulid::new(), None, g, true).await;
        assert!(matches!(result, Err(EngineError::Validation(_))), "granularity {g}");
    }
}

#[tokio::test]
async fn unknown_staff_not_found() {
    let engine = engine("unknown_staff.wal");
    let id = Ulid::new();
    assert!(matches!(engine.get_staff(id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(
        engine.resolve_slots(StaffSelector::Specific(id), monday()).await,
        Err(EngineError::NotFound(x)) if x == id
    ));
    assert!(matches!(
        engine.set_working_hours(id, Weekday::Mon, None).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn active_staff_ids_ascending_and_filtered() {
    let engine = engine("active_ids.wal");
    let (a, b, c) = (Ulid::from(3u128), Ulid::from(1u128), Ulid::from(2u128));
    for id in [a, b, c] {
        engine.create_staff(id, None, 30, true).await.unwrap();
    }
    engine.set_staff_active(c, false).await.unwrap();
    assert_eq!(engine.active_staff_ids().await, vec![b, a]);
    assert_eq!(engine.list_staff().await.len(), 3);
}

#[tokio::test]
async fn service_validation() {
    let engine = engine("service_validation.wal");
    let bad = [
        Service { id: Ulid::new(), name: "".into(), duration_min: 30, price: 100 },
        Service { id: Ulid::new(), name: "Cut".into(), duration_min: 0, price: 100 },
        Service { id: Ulid::new(), name: "Cut".into(), duration_min: 30, price: -1 },
    ];
    for s in bad {
        assert!(matches!(engine.upsert_service(s).await, Err(EngineError::Validation(_))));
    }
    assert!(matches!(
        engine.remove_service(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn line_items_totals() {
    let engine = engine("line_items.wal");
    let cut = add_service(&engine, 45, 3500).await;
    let wash = add_service(&engine, 15, 800).await;

    let items = engine.resolve_line_items(&[cut, wash]).unwrap();
    assert_eq!(items.duration_min, 60);
    assert_eq!(items.total_price, 4300);
    assert_eq!(items.services.len(), 2);

    assert!(matches!(engine.resolve_line_items(&[]), Err(EngineError::Validation(_))));
    assert!(matches!(
        engine.resolve_line_items(&[cut, Ulid::new()]),
        Err(EngineError::Validation(_))
    ));
    let too_many = vec![cut; crate::limits::MAX_SERVICES_PER_BOOKING + 1];
    assert!(matches!(engine.resolve_line_items(&too_many), Err(EngineError::Validation(_))));
}

// ── Slots ────────────────────────────────────────────────

#[tokio::test]
async fn slots_for_specific_staff() {
    let engine = engine("slots_specific.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(13, 0)).await;

    let slots = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert_eq!(
        available_times(&slots),
        vec![t(10, 0), t(10, 30), t(11, 0), t(11, 30), t(12, 0), t(12, 30)]
    );

    let tuesday = monday().succ_opt().unwrap();
    assert!(engine.resolve_slots(StaffSelector::Specific(sid), tuesday).await.unwrap().is_empty());
}

#[tokio::test]
async fn inactive_staff_has_no_slots_and_cannot_be_booked() {
    let engine = engine("inactive_staff.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    engine.set_staff_active(sid, false).await.unwrap();

    assert!(engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap().is_empty());
    assert!(engine.resolve_slots(StaffSelector::Any, monday()).await.unwrap().is_empty());
    let result = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn closing_weekday_removes_slots() {
    let engine = engine("close_weekday.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    engine.set_working_hours(sid, Weekday::Mon, None).await.unwrap();
    assert!(engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap().is_empty());
}

#[tokio::test]
async fn any_staff_union() {
    let engine = engine("any_union.wal");
    let a = Ulid::from(1u128);
    let b = Ulid::from(2u128);
    add_staff(&engine, a, 30, t(14, 0), t(15, 0)).await;
    add_staff(&engine, b, 30, t(14, 0), t(15, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    engine
        .create_booking(request(StaffSelector::Specific(a), t(14, 0), vec![svc]))
        .await
        .unwrap();
    let slots = engine.resolve_slots(StaffSelector::Any, monday()).await.unwrap();
    assert_eq!(slots[0], Slot { time: t(14, 0), available: true });

    engine
        .create_booking(request(StaffSelector::Specific(b), t(14, 0), vec![svc]))
        .await
        .unwrap();
    let slots = engine.resolve_slots(StaffSelector::Any, monday()).await.unwrap();
    assert_eq!(slots[0], Slot { time: t(14, 0), available: false });
    assert_eq!(slots[1], Slot { time: t(14, 30), available: true });
}

#[tokio::test]
async fn any_with_no_active_staff_is_empty() {
    let engine = engine("any_empty.wal");
    assert!(engine.resolve_slots(StaffSelector::Any, monday()).await.unwrap().is_empty());
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn browse_book_browse() {
    let engine = engine("browse_book.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(9, 30), t(12, 0)).await;
    let svc = add_service(&engine, 60, 5000).await;

    let before = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert!(before.iter().all(|s| s.available));

    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    assert_eq!(booking.staff_id, sid);
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.duration_min, 60);
    assert_eq!(booking.total_price, 5000);
    assert!(matches!(booking.customer, CustomerRef::Guest { .. }));

    let after = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert_eq!(available_times(&after), vec![t(9, 30), t(11, 0), t(11, 30)]);

    assert_eq!(engine.get_booking(booking.id).await.unwrap(), booking);
    assert_eq!(engine.active_commitments(sid, monday()).await.unwrap(), vec![booking]);
}

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let engine = engine("overlap_conflict.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(13, 0)).await;
    let svc = add_service(&engine, 60, 1000).await;

    let first = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    let second = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 30), vec![svc]))
        .await;
    assert!(matches!(second, Err(EngineError::Conflict(id)) if id == first.id));

    // Back to back is fine.
    assert_ok!(
        engine
            .create_booking(request(StaffSelector::Specific(sid), t(11, 0), vec![svc]))
            .await
    );
}

#[tokio::test]
async fn concurrent_commits_exactly_one_wins() {
    let engine = Arc::new(engine("race.wal"));
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(13, 0)).await;
    let svc = add_service(&engine, 60, 1000).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
                .await
        }));
    }
    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(engine.active_commitments(sid, monday()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn different_staff_commit_in_parallel() {
    let engine = Arc::new(engine("parallel_staff.wal"));
    let svc = add_service(&engine, 30, 1000).await;
    let mut ids = Vec::new();
    for _ in 0..4 {
        let sid = Ulid::new();
        add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
        ids.push(sid);
    }
    let mut handles = Vec::new();
    for sid in ids {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
                .await
        }));
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
}

#[tokio::test]
async fn price_is_frozen_at_commit() {
    let engine = engine("price_snapshot.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 2500).await;

    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    engine
        .upsert_service(Service { id: svc, name: "Cut".into(), duration_min: 30, price: 9900 })
        .await
        .unwrap();
    assert_eq!(engine.get_booking(booking.id).await.unwrap().total_price, 2500);
    assert_eq!(engine.get_service(svc).unwrap().price, 9900);
}

#[tokio::test]
async fn closing_overrun_policy() {
    let strict = engine("overrun_strict.wal");
    let sid = Ulid::new();
    add_staff(&strict, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&strict, 60, 1000).await;
    let late = strict
        .create_booking(request(StaffSelector::Specific(sid), t(11, 30), vec![svc]))
        .await;
    assert!(matches!(late, Err(EngineError::Validation(_))));

    let lenient = engine_with(
        "overrun_lenient.wal",
        SchedulingConfig { allow_closing_overrun: true, ..SchedulingConfig::default() },
    );
    add_staff(&lenient, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&lenient, 60, 1000).await;
    assert_ok!(
        lenient
            .create_booking(request(StaffSelector::Specific(sid), t(11, 30), vec![svc]))
            .await
    );
}

#[tokio::test]
async fn booking_outside_hours_rejected() {
    let engine = engine("outside_hours.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    for time in [t(9, 30), t(12, 0)] {
        let result = engine
            .create_booking(request(StaffSelector::Specific(sid), time, vec![svc]))
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
    let tuesday = BookingRequest {
        date: monday().succ_opt().unwrap(),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    assert!(matches!(engine.create_booking(tuesday).await, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn unknown_service_or_customer_rejected() {
    let engine = engine("unknown_refs.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    let result = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![Ulid::new()]))
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let stranger = Ulid::new();
    let req = BookingRequest {
        customer: CustomerInfo::Account(stranger),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    assert!(matches!(engine.create_booking(req).await, Err(EngineError::NotFound(x)) if x == stranger));

    let req = BookingRequest {
        customer: CustomerInfo::Guest(GuestInfo { name: "  ".into(), phone: None, email: None }),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    assert!(matches!(engine.create_booking(req).await, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn registered_customer_booking() {
    let engine = engine("registered_customer.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    let cid = Ulid::new();
    engine
        .register_customer(Customer {
            id: cid,
            name: "Grace".into(),
            phone: None,
            email: Some("grace@example.com".into()),
        })
        .await
        .unwrap();
    assert!(matches!(
        engine
            .register_customer(Customer { id: cid, name: "Again".into(), phone: None, email: None })
            .await,
        Err(EngineError::AlreadyExists(_))
    ));

    let req = BookingRequest {
        customer: CustomerInfo::Account(cid),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    let booking = engine.create_booking(req).await.unwrap();
    assert_eq!(booking.customer, CustomerRef::Account(cid));
    assert_eq!(engine.get_customer(cid).unwrap().name, "Grace");
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let engine = engine("dup_booking.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    let req = request(StaffSelector::Specific(sid), t(10, 0), vec![svc]);
    engine.create_booking(req.clone()).await.unwrap();
    let again = BookingRequest { time: t(11, 0), ..req };
    assert!(matches!(engine.create_booking(again).await, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_booking_id_on_two_staff_commits_once() {
    let engine = Arc::new(engine("dup_booking_race.wal"));
    let svc = add_service(&engine, 30, 1000).await;

    for round in 0..40 {
        let a = Ulid::new();
        let b = Ulid::new();
        add_staff(&engine, a, 30, t(10, 0), t(13, 0)).await;
        add_staff(&engine, b, 30, t(10, 0), t(13, 0)).await;
        let id = Ulid::new();

        let mut handles = Vec::new();
        for sid in [a, b] {
            let engine = engine.clone();
            let req = BookingRequest { id, ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc]) };
            handles.push(tokio::spawn(async move { engine.create_booking(req).await }));
        }
        let mut winners = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(c) => winners.push(c.staff_id),
                Err(EngineError::AlreadyExists(x)) => assert_eq!(x, id),
                Err(other) => panic!("round {round}: unexpected error: {other:?}"),
            }
        }
        assert_eq!(winners.len(), 1, "round {round}");
        let winner = winners[0];
        let loser = if winner == a { b } else { a };

        assert_eq!(engine.get_booking(id).await.unwrap().staff_id, winner);
        assert_eq!(engine.active_commitments(winner, monday()).await.unwrap().len(), 1);
        assert!(engine.active_commitments(loser, monday()).await.unwrap().is_empty());
    }
    assert!(engine.booking_ids_in_flight.is_empty());
}

#[tokio::test]
async fn failed_commit_releases_booking_id() {
    let engine = engine("booking_id_release.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    let early = request(StaffSelector::Specific(sid), t(9, 0), vec![svc]);
    assert!(matches!(engine.create_booking(early.clone()).await, Err(EngineError::Validation(_))));
    assert!(engine.booking_ids_in_flight.is_empty());

    let retry = BookingRequest { time: t(10, 0), ..early };
    assert_ok!(engine.create_booking(retry).await);
}

#[tokio::test]
async fn pending_initial_status() {
    let engine = engine_with(
        "pending_initial.wal",
        SchedulingConfig { initial_status: BookingStatus::Pending, ..SchedulingConfig::default() },
    );
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
    // Pending still holds the time.
    let slots = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert!(!slots[0].available);
}

// ── Any-staff assignment ─────────────────────────────────

#[tokio::test]
async fn any_assigns_first_free_staff() {
    let engine = engine("any_first_fit.wal");
    let a = Ulid::from(1u128);
    let b = Ulid::from(2u128);
    add_staff(&engine, a, 30, t(14, 0), t(16, 0)).await;
    add_staff(&engine, b, 30, t(14, 0), t(16, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    let first = engine
        .create_booking(request(StaffSelector::Any, t(14, 0), vec![svc]))
        .await
        .unwrap();
    assert_eq!(first.staff_id, a);
    let second = engine
        .create_booking(request(StaffSelector::Any, t(14, 0), vec![svc]))
        .await
        .unwrap();
    assert_eq!(second.staff_id, b);

    let third = engine
        .create_booking(request(StaffSelector::Any, t(14, 0), vec![svc]))
        .await;
    assert!(matches!(
        third,
        Err(EngineError::NoCapacity { date, time }) if date == monday() && time == t(14, 0)
    ));
}

#[tokio::test]
async fn any_skips_staff_whose_span_does_not_fit() {
    let engine = engine("any_span_fit.wal");
    let a = Ulid::from(1u128);
    let b = Ulid::from(2u128);
    add_staff(&engine, a, 30, t(14, 0), t(16, 0)).await;
    add_staff(&engine, b, 30, t(14, 0), t(16, 0)).await;
    let short = add_service(&engine, 30, 1000).await;
    let long = add_service(&engine, 60, 2000).await;

    // a is free at 14:00 but busy at 14:30.
    engine
        .create_booking(request(StaffSelector::Specific(a), t(14, 30), vec![short]))
        .await
        .unwrap();
    let booking = engine
        .create_booking(request(StaffSelector::Any, t(14, 0), vec![long]))
        .await
        .unwrap();
    assert_eq!(booking.staff_id, b);
}

#[tokio::test]
async fn least_booked_policy() {
    let engine = engine_with(
        "least_booked.wal",
        SchedulingConfig { policy: AssignmentPolicy::LeastBooked, ..SchedulingConfig::default() },
    );
    let a = Ulid::from(1u128);
    let b = Ulid::from(2u128);
    add_staff(&engine, a, 30, t(9, 0), t(17, 0)).await;
    add_staff(&engine, b, 30, t(9, 0), t(17, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    for time in [t(9, 0), t(9, 30)] {
        engine
            .create_booking(request(StaffSelector::Specific(a), time, vec![svc]))
            .await
            .unwrap();
    }
    let booking = engine
        .create_booking(request(StaffSelector::Any, t(15, 0), vec![svc]))
        .await
        .unwrap();
    assert_eq!(booking.staff_id, b);
}

// ── Idempotency ──────────────────────────────────────────

#[tokio::test]
async fn idempotent_retry_returns_same_booking() {
    let engine = engine("idempotent.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    let req = BookingRequest {
        idempotency_key: Some("checkout-42".into()),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    let first = engine.create_booking(req.clone()).await.unwrap();
    let retry = BookingRequest { id: Ulid::new(), ..req };
    let second = engine.create_booking(retry).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.active_commitments(sid, monday()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reused_idempotency_key_with_different_request_rejected() {
    let engine = engine("idempotent_mismatch.wal");
    let sid = Ulid::new();
    let other = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    add_staff(&engine, other, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    let svc2 = add_service(&engine, 30, 1500).await;

    let req = BookingRequest {
        idempotency_key: Some("checkout-7".into()),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    let first = engine.create_booking(req.clone()).await.unwrap();

    let later = BookingRequest { id: Ulid::new(), time: t(11, 0), ..req.clone() };
    let elsewhere = BookingRequest { id: Ulid::new(), staff: StaffSelector::Specific(other), ..req.clone() };
    let different_services = BookingRequest { id: Ulid::new(), services: vec![svc2], ..req.clone() };
    for mismatch in [later, elsewhere, different_services] {
        assert!(matches!(engine.create_booking(mismatch).await, Err(EngineError::Validation(_))));
    }

    // A genuine retry, including one that leaves the staff choice open, still
    // gets the original booking.
    let any = BookingRequest { id: Ulid::new(), staff: StaffSelector::Any, ..req };
    assert_eq!(engine.create_booking(any).await.unwrap(), first);
    assert_eq!(engine.active_commitments(sid, monday()).await.unwrap().len(), 1);
    assert!(engine.active_commitments(other, monday()).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_booking_releases_idempotency_key() {
    let engine = engine("idempotent_release.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    let bad = BookingRequest {
        idempotency_key: Some("k1".into()),
        ..request(StaffSelector::Specific(sid), t(9, 0), vec![svc])
    };
    assert!(engine.create_booking(bad).await.is_err());

    let good = BookingRequest {
        idempotency_key: Some("k1".into()),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    assert_ok!(engine.create_booking(good).await);
}

#[tokio::test]
async fn in_flight_key_is_duplicate_request() {
    let engine = engine("idempotent_inflight.wal");
    engine.idempotency.insert("busy".into(), None);
    let req = BookingRequest {
        idempotency_key: Some("busy".into()),
        ..request(StaffSelector::Any, t(10, 0), vec![Ulid::new()])
    };
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::DuplicateRequest(k)) if k == "busy"
    ));
}

// ── Status transitions ───────────────────────────────────

#[tokio::test]
async fn cancel_frees_time() {
    let engine = engine("cancel_frees.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 60, 1000).await;

    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    let cancelled = engine.cancel_booking(booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);

    let slots = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert!(slots.iter().all(|s| s.available));
    assert!(engine.active_commitments(sid, monday()).await.unwrap().is_empty());
    // Still listed, with its final status.
    let listed = engine.list_bookings(sid, monday()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, BookingStatus::Cancelled);

    assert_ok!(
        engine
            .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
            .await
    );
}

#[tokio::test]
async fn status_lifecycle() {
    let engine = engine("status_lifecycle.wal");
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();

    let checked_in = engine.set_booking_status(booking.id, BookingStatus::CheckedIn).await.unwrap();
    assert_eq!(checked_in.status, BookingStatus::CheckedIn);
    assert!(matches!(
        engine.cancel_booking(booking.id).await,
        Err(EngineError::Validation(_))
    ));
    engine.set_booking_status(booking.id, BookingStatus::Completed).await.unwrap();
    // Completed bookings keep their time.
    let slots = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert!(!slots[0].available);
    assert!(matches!(
        engine.set_booking_status(booking.id, BookingStatus::Confirmed).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn status_change_on_unknown_booking() {
    let engine = engine("status_unknown.wal");
    assert!(matches!(
        engine.cancel_booking(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Notifier ─────────────────────────────────────────────

struct FailingNotifier {
    calls: AtomicUsize,
}

#[async_trait]
impl crate::notify::BookingNotifier for FailingNotifier {
    async fn booking_created(
        &self,
        _customer: &CustomerRef,
        _commitment: &Commitment,
    ) -> Result<(), NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Delivery("smtp down".into()))
    }
}

#[tokio::test]
async fn notifier_failure_does_not_fail_commit() {
    let notifier = Arc::new(FailingNotifier { calls: AtomicUsize::new(0) });
    let engine = Engine::new(
        test_wal_path("notifier_failure.wal"),
        SchedulingConfig::default(),
        notifier.clone(),
    )
    .unwrap();
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;

    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    assert_eq!(engine.get_booking(booking.id).await.unwrap(), booking);

    for _ in 0..100 {
        if notifier.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn broadcast_notifier_sees_booking() {
    let notifier = Arc::new(BroadcastNotifier::new());
    let mut rx = notifier.subscribe();
    let engine = Engine::new(
        test_wal_path("notifier_broadcast.wal"),
        SchedulingConfig::default(),
        notifier,
    )
    .unwrap();
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), booking);
}

#[tokio::test]
async fn change_feed_publishes_events() {
    let engine = engine("change_feed.wal");
    let mut rx = engine.subscribe();
    let sid = Ulid::new();
    engine.create_staff(sid, None, 30, true).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), Event::StaffCreated { id, .. } if id == sid));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restores.wal");
    let sid = Ulid::new();
    let cid = Ulid::new();
    let (svc, kept, cancelled) = {
        let engine =
            Engine::new(path.clone(), SchedulingConfig::default(), Arc::new(BroadcastNotifier::new()))
                .unwrap();
        engine.create_staff(sid, Some("Mia".into()), 30, true).await.unwrap();
        engine
            .set_working_hours(sid, Weekday::Mon, hours(t(10, 0), t(13, 0)))
            .await
            .unwrap();
        let svc = add_service(&engine, 60, 4000).await;
        engine
            .register_customer(Customer { id: cid, name: "Grace".into(), phone: None, email: None })
            .await
            .unwrap();
        let kept = engine
            .create_booking(BookingRequest {
                customer: CustomerInfo::Account(cid),
                idempotency_key: Some("replayed-key".into()),
                ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
            })
            .await
            .unwrap();
        let cancelled = engine
            .create_booking(request(StaffSelector::Specific(sid), t(11, 0), vec![svc]))
            .await
            .unwrap();
        engine.cancel_booking(cancelled.id).await.unwrap();
        (svc, kept, cancelled.id)
    };

    let engine =
        Engine::new(path, SchedulingConfig::default(), Arc::new(BroadcastNotifier::new())).unwrap();
    assert_eq!(engine.get_staff(sid).await.unwrap().name.as_deref(), Some("Mia"));
    assert_eq!(engine.get_service(svc).unwrap().price, 4000);
    assert_eq!(engine.get_customer(cid).unwrap().name, "Grace");
    assert_eq!(engine.get_booking(kept.id).await.unwrap(), kept);
    assert_eq!(
        engine.get_booking(cancelled).await.unwrap().status,
        BookingStatus::Cancelled
    );
    let slots = engine.resolve_slots(StaffSelector::Specific(sid), monday()).await.unwrap();
    assert_eq!(available_times(&slots), vec![t(11, 0), t(11, 30), t(12, 0), t(12, 30)]);

    // Idempotency survives a restart.
    let retry = BookingRequest {
        id: Ulid::new(),
        customer: CustomerInfo::Account(cid),
        idempotency_key: Some("replayed-key".into()),
        ..request(StaffSelector::Specific(sid), t(10, 0), vec![svc])
    };
    assert_eq!(engine.create_booking(retry).await.unwrap().id, kept.id);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let sid = Ulid::new();
    let booking = {
        let engine =
            Engine::new(path.clone(), SchedulingConfig::default(), Arc::new(BroadcastNotifier::new()))
                .unwrap();
        add_staff(&engine, sid, 30, t(10, 0), t(13, 0)).await;
        // Churn that compaction folds away.
        for _ in 0..5 {
            engine.set_staff_active(sid, false).await.unwrap();
            engine.set_staff_active(sid, true).await.unwrap();
        }
        let svc = add_service(&engine, 30, 1500).await;
        let booking = engine
            .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
            .await
            .unwrap();
        engine.set_booking_status(booking.id, BookingStatus::CheckedIn).await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 10);
        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        booking
    };

    let engine =
        Engine::new(path, SchedulingConfig::default(), Arc::new(BroadcastNotifier::new())).unwrap();
    let restored = engine.get_booking(booking.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::CheckedIn);
    assert_eq!(restored.total_price, 1500);
    let info = engine.get_staff(sid).await.unwrap();
    assert!(info.active);
    assert_eq!(info.hours.for_weekday(Weekday::Mon), hours(t(10, 0), t(13, 0)));
}

#[tokio::test]
async fn business_offset_applies_to_bookings() {
    let clock = BusinessClock::from_offset_minutes(120).unwrap();
    let engine = engine_with(
        "business_offset.wal",
        SchedulingConfig { clock, ..SchedulingConfig::default() },
    );
    let sid = Ulid::new();
    add_staff(&engine, sid, 30, t(10, 0), t(12, 0)).await;
    let svc = add_service(&engine, 30, 1000).await;
    let booking = engine
        .create_booking(request(StaffSelector::Specific(sid), t(10, 0), vec![svc]))
        .await
        .unwrap();
    // 10:00 at +02:00 is 08:00 UTC.
    assert_eq!(
        booking.span.start,
        monday().and_time(t(8, 0)).and_utc().timestamp_millis()
    );
    assert_eq!(clock.local_time(booking.span.start), Some(t(10, 0)));
}
