use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tracing_subscriber::EnvFilter;

use courtbook::{
    checkin::{CheckInMethod, CheckInMethodKind, CheckInPolicy, CheckInRequest, CheckInState, StaticPolicies},
    clock::ManualClock,
    core::store::ReservationStore,
    error::BookingError,
    op::StoredOp,
    persist::{OpSink, PersistError, PersistResult},
    recurrence::{Frequency, RecurrenceRule},
    reservation::{ReservationDraft, ReservationPatch, Resource},
    runtime::{
        events::BookingEvent,
        handle::{spawn_booking, BookingHandle, RuntimeConfig},
    },
    types::{OpSeq, PaymentStatus, TimeRange},
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("date")
}

fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    date.and_hms_opt(h, m, 0).expect("time")
}

fn draft(date: NaiveDate, start: (u32, u32), end: (u32, u32), booked_by: u64) -> ReservationDraft {
    ReservationDraft {
        resource_id: 1,
        date,
        range: TimeRange::hm(start, end).expect("range"),
        booked_by,
        payment: PaymentStatus::Unpaid,
        notes: String::new(),
    }
}

fn court() -> Resource {
    Resource {
        id: 1,
        facility_id: 1,
        name: "Court 1".to_string(),
        active: true,
    }
}

fn policies() -> Arc<StaticPolicies> {
    Arc::new(StaticPolicies::uniform(CheckInPolicy::default()))
}

async fn spawn_at(now: NaiveDateTime) -> (BookingHandle, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(now));
    let handle = spawn_booking(
        ReservationStore::new(),
        None,
        clock.clone(),
        policies(),
        RuntimeConfig::default(),
    );
    handle.register_resource(court()).await.expect("register");
    (handle, clock)
}

async fn next_domain_event(sub: &mut tokio::sync::broadcast::Receiver<BookingEvent>) -> BookingEvent {
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event")
            .expect("recv");
        if !matches!(evt, BookingEvent::DurableUpTo { .. }) {
            return evt;
        }
    }
}

struct SlowSink {
    seen: Arc<Mutex<Vec<OpSeq>>>,
    delay: Duration,
}

impl OpSink for SlowSink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        std::thread::sleep(self.delay);
        let mut seen = self.seen.lock().expect("lock");
        for op in ops {
            seen.push(op.seq);
        }
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

struct FlakySink {
    seen: Arc<Mutex<Vec<OpSeq>>>,
    failing: Arc<AtomicBool>,
}

impl OpSink for FlakySink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Unique("reservations.resource_id, reservations.date".to_string()));
        }
        let mut seen = self.seen.lock().expect("lock");
        seen.extend(ops.iter().map(|o| o.seq));
        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }
}

#[tokio::test]
async fn concurrent_bookings_of_one_slot_admit_exactly_one() {
    let day = ymd(2024, 6, 3);
    let (handle, _) = spawn_at(at(day, 8, 0)).await;

    let tasks: Vec<_> = (0..8u64)
        .map(|actor| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.create_single(draft(day, (10, 0), (11, 0), actor)).await })
        })
        .collect();

    let mut created = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => created += 1,
            Err(BookingError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(handle.active_on(1, day).await.expect("active").len(), 1);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn concurrent_check_ins_record_once() {
    let day = ymd(2024, 6, 3);
    let (handle, _) = spawn_at(at(day, 9, 50)).await;
    let reservation = handle
        .create_single(draft(day, (10, 0), (11, 0), 4))
        .await
        .expect("create");

    let tasks: Vec<_> = (0..4u64)
        .map(|actor_id| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .check_in(CheckInRequest {
                        reservation_id: reservation.id,
                        method: CheckInMethod::Manual,
                        actor_id,
                        note: String::new(),
                    })
                    .await
            })
        })
        .collect();

    let mut ok = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => ok += 1,
            Err(BookingError::AlreadyCheckedIn { .. }) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(ok, 1);

    let record = handle
        .check_in_record(reservation.id)
        .await
        .expect("query")
        .expect("record");
    assert_eq!(record.checked_in_at, at(day, 9, 50));
    let stored = handle.get(reservation.id).await.expect("get").expect("reservation");
    assert!(stored.checked_in);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn recurring_conflict_rolls_back_every_occurrence() {
    let start = ymd(2024, 6, 3);
    let (handle, _) = spawn_at(at(start, 8, 0)).await;
    handle
        .create_single(draft(ymd(2024, 6, 17), (18, 30), (19, 0), 2))
        .await
        .expect("blocker");

    let err = handle
        .create_recurring(draft(start, (18, 0), (19, 30), 3), RecurrenceRule::new(Frequency::Weekly, 4))
        .await
        .expect_err("occurrence 3 collides");
    assert_eq!(err.conflict().and_then(|c| c.occurrence), Some(3));

    for week in [ymd(2024, 6, 3), ymd(2024, 6, 10), ymd(2024, 6, 24)] {
        assert!(handle.active_on(1, week).await.expect("active").is_empty());
    }

    let created = handle
        .create_recurring(draft(start, (7, 0), (8, 0), 3), RecurrenceRule::new(Frequency::Weekly, 4))
        .await
        .expect("clear series");
    assert_eq!(created.len(), 4);
    let series_id = created[0].series.as_ref().expect("series").series_id;
    assert_eq!(handle.series(series_id).await.expect("series"), created);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn events_follow_successful_mutations() {
    let day = ymd(2024, 6, 3);
    let (handle, _) = spawn_at(at(day, 9, 45)).await;
    let mut sub = handle.subscribe();

    let reservation = handle
        .create_single(draft(day, (10, 0), (11, 0), 11))
        .await
        .expect("create");
    let _ = handle.create_single(draft(day, (10, 30), (11, 30), 12)).await;
    handle
        .edit(
            reservation.id,
            ReservationPatch {
                notes: Some("bring balls".to_string()),
                ..ReservationPatch::default()
            },
            11,
        )
        .await
        .expect("edit");
    handle
        .check_in(CheckInRequest {
            reservation_id: reservation.id,
            method: CheckInMethod::QrCode,
            actor_id: 20,
            note: String::new(),
        })
        .await
        .expect("check in");

    assert_eq!(
        next_domain_event(&mut sub).await,
        BookingEvent::ReservationCreated {
            reservation_id: reservation.id,
            actor_id: 11
        }
    );
    assert_eq!(
        next_domain_event(&mut sub).await,
        BookingEvent::ReservationEdited {
            reservation_id: reservation.id,
            actor_id: 11
        }
    );
    let checked = next_domain_event(&mut sub).await;
    assert_eq!(
        checked,
        BookingEvent::CheckedIn {
            reservation_id: reservation.id,
            actor_id: 20,
            method: CheckInMethodKind::QrCode
        }
    );
    assert_eq!(checked.kind(), "checked_in");

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cancel_is_idempotent_and_emits_once() {
    let day = ymd(2024, 6, 3);
    let (handle, _) = spawn_at(at(day, 8, 0)).await;
    let reservation = handle
        .create_single(draft(day, (10, 0), (11, 0), 1))
        .await
        .expect("create");
    let mut sub = handle.subscribe();

    handle.cancel(reservation.id, 1).await.expect("cancel");
    handle.cancel(reservation.id, 1).await.expect("cancel again");
    handle
        .create_single(draft(day, (10, 0), (11, 0), 2))
        .await
        .expect("slot freed");

    assert!(matches!(
        next_domain_event(&mut sub).await,
        BookingEvent::ReservationCancelled { .. }
    ));
    assert!(matches!(
        next_domain_event(&mut sub).await,
        BookingEvent::ReservationCreated { actor_id: 2, .. }
    ));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn qr_scan_checks_in_within_the_window() {
    let day = ymd(2024, 6, 3);
    let (handle, clock) = spawn_at(at(day, 8, 0)).await;
    let reservation = handle
        .create_single(draft(day, (10, 0), (11, 0), 1))
        .await
        .expect("create");
    let payload = handle.issue_qr(reservation.id).await.expect("issue");

    assert!(matches!(
        handle.scan_qr("not-a-token", 5, "").await,
        Err(BookingError::InvalidQr(_))
    ));
    assert!(matches!(
        handle.scan_qr(payload.clone(), 5, "").await,
        Err(BookingError::WindowClosed { .. })
    ));
    assert!(matches!(
        handle.check_in_state(reservation.id).await.expect("state"),
        CheckInState::NotEligible { .. }
    ));

    clock.advance(TimeDelta::minutes(100));
    let record = handle.scan_qr(payload.clone(), 5, "front desk").await.expect("scan");
    assert_eq!(record.method, CheckInMethod::QrCode);
    assert_eq!(record.note, "front desk");
    assert!(matches!(
        handle.scan_qr(payload, 5, "").await,
        Err(BookingError::AlreadyCheckedIn { .. })
    ));
    assert_eq!(
        handle.check_in_state(reservation.id).await.expect("state"),
        CheckInState::CheckedIn { at: at(day, 9, 40) }
    );

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn inactive_resource_rejects_new_bookings() {
    let day = ymd(2024, 6, 3);
    let (handle, _) = spawn_at(at(day, 8, 0)).await;
    handle.set_resource_active(1, false).await.expect("deactivate");

    assert!(matches!(
        handle.create_single(draft(day, (10, 0), (11, 0), 1)).await,
        Err(BookingError::ResourceInactive(1))
    ));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn mutations_reply_only_after_the_sink_acknowledges() {
    init_tracing();
    let day = ymd(2024, 6, 3);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(40),
    };
    let cfg = RuntimeConfig {
        persist_queue_bound: 1,
        snapshot_every_ops: 0,
        ..RuntimeConfig::default()
    };

    let handle = spawn_booking(
        ReservationStore::new(),
        Some(Box::new(sink)),
        Arc::new(ManualClock::new(at(day, 8, 0))),
        policies(),
        cfg,
    );
    let mut sub = handle.subscribe();
    handle.register_resource(court()).await.expect("register");
    assert_eq!(*seen.lock().expect("lock"), vec![1]);

    let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("recv timeout")
        .expect("recv");
    assert_eq!(evt, BookingEvent::DurableUpTo { op_seq: 1 });

    for hour in 6..10u32 {
        handle
            .create_single(draft(day, (hour, 0), (hour + 1, 0), 1))
            .await
            .expect("create");
        let last = seen.lock().expect("lock").last().copied();
        assert_eq!(last, Some(u64::from(hour) - 4));
    }

    assert_eq!(handle.flush().await.expect("flush"), 5);
    handle.shutdown().await.expect("shutdown");
    assert_eq!(*seen.lock().expect("lock"), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn failed_append_surfaces_storage_error_and_rolls_back() {
    init_tracing();
    let day = ymd(2024, 6, 3);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let failing = Arc::new(AtomicBool::new(false));
    let sink = FlakySink {
        seen: Arc::clone(&seen),
        failing: Arc::clone(&failing),
    };
    let handle = spawn_booking(
        ReservationStore::new(),
        Some(Box::new(sink)),
        Arc::new(ManualClock::new(at(day, 9, 50))),
        policies(),
        RuntimeConfig::default(),
    );
    handle.register_resource(court()).await.expect("register");
    let mut sub = handle.subscribe();

    failing.store(true, Ordering::SeqCst);
    let err = handle
        .create_single(draft(day, (10, 0), (11, 0), 1))
        .await
        .expect_err("append rejected");
    assert!(matches!(err, BookingError::Storage(PersistError::Unique(_))));
    assert!(handle.active_on(1, day).await.expect("active").is_empty());
    assert!(!handle
        .has_conflict(1, day, TimeRange::hm((10, 0), (11, 0)).expect("range"), None)
        .await
        .expect("query"));
    assert!(handle.get(1).await.expect("get").is_none());
    assert!(matches!(sub.try_recv(), Err(tokio::sync::broadcast::error::TryRecvError::Empty)));

    failing.store(false, Ordering::SeqCst);
    let reservation = handle
        .create_single(draft(day, (10, 0), (11, 0), 1))
        .await
        .expect("create after recovery");
    assert_eq!(reservation.id, 1);

    failing.store(true, Ordering::SeqCst);
    let err = handle
        .check_in(CheckInRequest {
            reservation_id: reservation.id,
            method: CheckInMethod::Manual,
            actor_id: 2,
            note: String::new(),
        })
        .await
        .expect_err("check-in append rejected");
    assert!(matches!(err, BookingError::Storage(_)));
    let stored = handle.get(reservation.id).await.expect("get").expect("reservation");
    assert!(!stored.checked_in);
    assert!(handle.check_in_record(reservation.id).await.expect("query").is_none());

    failing.store(false, Ordering::SeqCst);
    let record = handle
        .check_in(CheckInRequest {
            reservation_id: reservation.id,
            method: CheckInMethod::Manual,
            actor_id: 2,
            note: String::new(),
        })
        .await
        .expect("check in after recovery");
    assert_eq!(record.id, 1);

    assert_eq!(handle.flush().await.expect("flush"), 3);
    handle.shutdown().await.expect("shutdown");
    assert_eq!(*seen.lock().expect("lock"), vec![1, 2, 3]);
}
