use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use courtbook::{
    checkin::{CheckInMethod, CheckInPolicy, CheckInRequest, StaticPolicies},
    clock::ManualClock,
    core::store::ReservationStore,
    persist::{sqlite::SqliteOpSink, OpSink, PersistError},
    recurrence::{Frequency, RecurrenceRule},
    reservation::{ReservationDraft, ReservationPatch, Resource},
    runtime::handle::{spawn_booking, RuntimeConfig},
    types::{PaymentStatus, TimeRange},
};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 3).expect("date")
}

fn at(h: u32, m: u32) -> NaiveDateTime {
    day().and_hms_opt(h, m, 0).expect("time")
}

fn draft(start: u32) -> ReservationDraft {
    ReservationDraft {
        resource_id: 1,
        date: day(),
        range: TimeRange::hm((start, 0), (start + 1, 0)).expect("range"),
        booked_by: 8,
        payment: PaymentStatus::Partial,
        notes: "doubles".to_string(),
    }
}

fn seeded_store() -> ReservationStore {
    let mut store = ReservationStore::new();
    store
        .register_resource(Resource {
            id: 1,
            facility_id: 3,
            name: "Center Court".to_string(),
            active: true,
        })
        .expect("register");
    store
}

#[test]
fn sqlite_replay_round_trips_state_and_order() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("bookings.db");

    let mut store = seeded_store();
    let mut sink = SqliteOpSink::open(&db_path).expect("open sqlite");

    let (first, _) = store.create(draft(10)).expect("create");
    let (second, _) = store.create(draft(12)).expect("create");
    store
        .create_series(draft(18), RecurrenceRule::new(Frequency::Biweekly, 3))
        .expect("series");
    store
        .edit(
            first.id,
            ReservationPatch {
                payment: Some(PaymentStatus::Paid),
                ..ReservationPatch::default()
            },
        )
        .expect("edit");
    store.cancel(second.id).expect("cancel");
    store
        .check_in(
            CheckInRequest {
                reservation_id: first.id,
                method: CheckInMethod::Manual,
                actor_id: 2,
                note: "walk-in".to_string(),
            },
            &CheckInPolicy::default(),
            at(9, 45),
        )
        .expect("check in");
    let (blackout, _) = store
        .add_blackout(1, day(), TimeRange::hm((14, 0), (15, 0)).expect("range"), "lines")
        .expect("blackout");
    store.add_blackout(1, day(), TimeRange::hm((15, 0), (16, 0)).expect("range"), "nets").expect("blackout");
    store.remove_blackout(blackout.id).expect("lift");

    let ops = store.drain_pending_ops();
    let durable = sink.append_ops(&ops).expect("append");
    assert_eq!(durable, store.latest_op_seq());
    assert_eq!(sink.find_active(1, day()).expect("active"), vec![first.id, 3]);
    assert_eq!(sink.check_in_count(first.id).expect("count"), 1);

    drop(sink);

    let sink2 = SqliteOpSink::open(&db_path).expect("reopen");
    let replayed = sink2.load_store().expect("replay");

    assert_eq!(replayed.export_snapshot(), store.export_snapshot());
    assert_eq!(replayed.latest_op_seq(), store.latest_op_seq());
    assert!(replayed.has_conflict(1, day(), &TimeRange::hm((15, 30), (16, 30)).expect("range"), None));
    assert!(!replayed.has_conflict(1, day(), &TimeRange::hm((14, 0), (15, 0)).expect("range"), None));
}

#[test]
fn snapshot_and_compaction_preserve_replay() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("snap.db");

    let mut store = seeded_store();
    let mut sink = SqliteOpSink::open(&db_path).expect("open sqlite");

    for hour in 7..15 {
        let _ = store.create(draft(hour)).expect("create");
    }
    sink.append_ops(&store.drain_pending_ops()).expect("append");

    let snapshot = store.export_snapshot();
    let last_seq = store.latest_op_seq();
    sink.write_snapshot(&snapshot, last_seq).expect("snapshot");
    let removed = sink.compact_through(last_seq).expect("compact");
    assert!(removed > 0);
    assert!(sink.load_events_after(0).expect("events").is_empty());

    store.cancel(2).expect("cancel");
    sink.append_ops(&store.drain_pending_ops()).expect("append tail");

    drop(sink);

    let reopened = SqliteOpSink::open(&db_path).expect("reopen");
    let replayed = reopened.load_store().expect("replay");
    assert_eq!(replayed.export_snapshot(), store.export_snapshot());
    assert!(!replayed.get(2).expect("record").is_active());
}

#[test]
fn unique_index_backstops_double_booking() {
    let mut sink = SqliteOpSink::open_in_memory().expect("open");

    let mut writer_a = seeded_store();
    writer_a.create(draft(10)).expect("a");
    sink.append_ops(&writer_a.drain_pending_ops()).expect("append a");

    // A second writer that never saw the first one's booking.
    let mut writer_b = seeded_store();
    writer_b.create(draft(8)).expect("b filler");
    writer_b.create(draft(10)).expect("b");
    let ops = writer_b.drain_pending_ops();
    let stale = ops.last().cloned().expect("op");

    let err = sink.append_ops(&[stale]).expect_err("backstop");
    assert!(matches!(err, PersistError::Unique(_)), "got {err:?}");
    assert_eq!(sink.find_active(1, day()).expect("active"), vec![1]);
    assert_eq!(sink.latest_seq().expect("seq"), 2);
}

#[test]
fn corrupt_payload_fails_replay() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("corrupt.db");
    drop(SqliteOpSink::open(&db_path).expect("create"));

    let conn = rusqlite::Connection::open(&db_path).expect("raw");
    conn.execute(
        "INSERT INTO events(seq, ts_ms, kind, subject_id, payload) VALUES (1, 0, 1, 1, x'00ff')",
        [],
    )
    .expect("insert");
    drop(conn);

    let sink = SqliteOpSink::open(&db_path).expect("reopen");
    assert!(sink.load_store().is_err());
}

#[tokio::test]
async fn runtime_journals_through_sqlite_sink() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("runtime.db");

    let sink = SqliteOpSink::open(&db_path).expect("open sqlite");
    let cfg = RuntimeConfig::from_json_str(r#"{"persist_queue_bound": 8, "compact_after_snapshot": true}"#)
        .expect("config");
    let handle = spawn_booking(
        sink.load_store().expect("empty replay"),
        Some(Box::new(sink)),
        Arc::new(ManualClock::new(at(9, 40))),
        Arc::new(StaticPolicies::default()),
        cfg,
    );

    handle
        .register_resource(Resource {
            id: 1,
            facility_id: 3,
            name: "Center Court".to_string(),
            active: true,
        })
        .await
        .expect("register");
    let reservation = handle.create_single(draft(10)).await.expect("create");
    handle
        .check_in(CheckInRequest {
            reservation_id: reservation.id,
            method: CheckInMethod::Manual,
            actor_id: 1,
            note: String::new(),
        })
        .await
        .expect("check in");
    handle.checkpoint().await.expect("checkpoint");
    handle.cancel(reservation.id, 1).await.expect("cancel");
    let durable = handle.flush().await.expect("flush");
    assert_eq!(durable, 4);
    handle.shutdown().await.expect("shutdown");

    let reopened = SqliteOpSink::open(&db_path).expect("reopen");
    assert_eq!(reopened.load_events_after(0).expect("tail").len(), 1);
    let replayed = reopened.load_store().expect("replay");
    let record = replayed.get(reservation.id).expect("record");
    assert!(record.checked_in);
    assert!(!record.is_active());
    assert_eq!(replayed.check_in_count(), 1);
}
