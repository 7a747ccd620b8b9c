//! Court booking core: conflict-free reservations, recurring series, and
//! verified check-in, with an append-only SQLite journal.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::ReservationStore`]:
//! ```
//! use chrono::NaiveDate;
//! use courtbook::{
//!     core::store::ReservationStore,
//!     reservation::{ReservationDraft, Resource},
//!     types::{PaymentStatus, TimeRange},
//! };
//!
//! let mut store = ReservationStore::new();
//! store
//!     .register_resource(Resource { id: 1, facility_id: 1, name: "Court 1".into(), active: true })
//!     .expect("register");
//! let date = NaiveDate::from_ymd_opt(2024, 6, 3).expect("date");
//! let draft = ReservationDraft {
//!     resource_id: 1,
//!     date,
//!     range: TimeRange::hm((10, 0), (11, 0)).expect("range"),
//!     booked_by: 7,
//!     payment: PaymentStatus::Unpaid,
//!     notes: String::new(),
//! };
//! let (first, _op) = store.create(draft.clone()).expect("create");
//! assert_eq!(first.id, 1);
//! assert!(store.create(draft).expect_err("double booking").conflict().is_some());
//! ```
//!
//! Runtime usage with SQLite sink:
//! ```no_run
//! use std::sync::Arc;
//!
//! use courtbook::{
//!     checkin::StaticPolicies,
//!     clock::SystemClock,
//!     core::store::ReservationStore,
//!     persist::sqlite::SqliteOpSink,
//!     runtime::handle::{spawn_booking, RuntimeConfig},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteOpSink::open("courtbook.db").expect("open sqlite");
//! let store = sink.load_store().expect("replay");
//! let handle = spawn_booking(
//!     store,
//!     Some(Box::new(sink)),
//!     Arc::new(SystemClock),
//!     Arc::new(StaticPolicies::default()),
//!     RuntimeConfig::default(),
//! );
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```

pub mod checkin;
pub mod clock;
/// Authoritative in-memory store, slot indices and overlap rules.
pub mod core;
/// Error taxonomy shared by every operation.
pub mod error;
pub mod geo;
/// Mutation op model and persistence wrapper types.
pub mod op;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Versioned QR payload codec.
pub mod qr;
/// Recurrence expansion for weekly, biweekly and monthly series.
pub mod recurrence;
pub mod reservation;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Shared ids, statuses and time ranges.
pub mod types;
