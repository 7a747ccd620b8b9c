//! SQLite-backed op journal with materialized reservation tables.
//!
//! Every appended op is journaled in `events` and, in the same transaction,
//! projected into `reservations`, `check_ins`, `resources` and `blackouts`.
//! The projection carries the uniqueness constraints that back the runtime's
//! concurrency guard.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::{
    checkin::CheckInRecord,
    core::store::{ReservationStore, StoreSnapshotV1},
    op::{Op, StoredOp, StoredOpEnvelope},
    reservation::{Blackout, Reservation, Resource},
    types::{OpSeq, ReservationId, ResourceId},
};

use super::{OpSink, PersistError, PersistResult};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;
const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M";
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u16,
    snapshot: StoreSnapshotV1,
}

/// SQLite implementation of [`crate::persist::OpSink`].
pub struct SqliteOpSink {
    conn: Connection,
}

impl SqliteOpSink {
    /// Opens or creates a SQLite-backed sink at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Loads store state from latest snapshot plus tail events.
    pub fn load_store(&self) -> PersistResult<ReservationStore> {
        let mut store = if let Some(snapshot) = self.load_latest_snapshot()? {
            ReservationStore::from_snapshot(snapshot)?
        } else {
            ReservationStore::new()
        };

        let start_seq = store.latest_op_seq();
        for event in self.load_events_after(start_seq)? {
            store.apply_replayed_op(event)?;
        }
        Ok(store)
    }

    pub fn load_events_after(&self, seq: OpSeq) -> PersistResult<Vec<StoredOp>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, ts_ms, payload FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let rows = stmt.query_map(params![seq as i64], |row| {
            let seq: i64 = row.get(0)?;
            let ts_ms: i64 = row.get(1)?;
            let payload: Vec<u8> = row.get(2)?;
            let mut op = decode_stored_op_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            op.seq = seq as OpSeq;
            op.ts_ms = ts_ms as u64;
            Ok(op)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn write_snapshot(
        &mut self,
        snapshot: &StoreSnapshotV1,
        last_seq: OpSeq,
    ) -> PersistResult<()> {
        let env = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        self.conn.execute(
            "INSERT INTO snapshots(last_seq, ts_ms, payload) VALUES (?1, ?2, ?3)",
            params![last_seq as i64, now_ms() as i64, payload],
        )?;
        Ok(())
    }

    pub fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        let count = self
            .conn
            .execute("DELETE FROM events WHERE seq <= ?1", params![seq as i64])?;
        Ok(count)
    }

    pub fn latest_seq(&self) -> PersistResult<OpSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM events", [], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0) as OpSeq)
    }

    /// Ids of materialized non-cancelled reservations of one slot, by start time.
    pub fn find_active(&self, resource_id: ResourceId, date: NaiveDate) -> PersistResult<Vec<ReservationId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM reservations
             WHERE resource_id = ?1 AND date = ?2 AND status != 'cancelled'
             ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map(
            params![resource_id as i64, date.format(DATE_FMT).to_string()],
            |row| row.get::<_, i64>(0),
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row? as ReservationId);
        }
        Ok(out)
    }

    /// Number of materialized check-in records for `reservation_id`.
    pub fn check_in_count(&self, reservation_id: ReservationId) -> PersistResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM check_ins WHERE reservation_id = ?1",
            params![reservation_id as i64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn load_latest_snapshot(&self) -> PersistResult<Option<StoreSnapshotV1>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let env: SnapshotEnvelope = serde_json::from_slice(&payload)?;
        if env.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistError::Message(
                "unsupported snapshot format".to_string(),
            ));
        }
        Ok(Some(env.snapshot))
    }
}

impl OpSink for SqliteOpSink {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq> {
        if ops.is_empty() {
            return self.latest_seq();
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events(seq, ts_ms, kind, subject_id, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for stored in ops {
                let payload = serde_json::to_vec(&StoredOpEnvelope::new(stored.clone()))?;
                stmt.execute(params![
                    stored.seq as i64,
                    stored.ts_ms as i64,
                    stored.op.kind(),
                    subject_id(&stored.op).map(|v| v as i64),
                    payload,
                ])?;
                materialize(&tx, &stored.op)?;
            }
        }
        tx.commit()?;

        Ok(ops.last().map(|o| o.seq).unwrap_or(0))
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &StoreSnapshotV1, last_seq: OpSeq) -> PersistResult<()> {
        SqliteOpSink::write_snapshot(self, snapshot, last_seq)
    }

    fn compact_through(&mut self, seq: OpSeq) -> PersistResult<usize> {
        SqliteOpSink::compact_through(self, seq)
    }
}

fn materialize(tx: &Transaction<'_>, op: &Op) -> PersistResult<()> {
    match op {
        Op::UpsertResource { resource } => upsert_resource(tx, resource),
        Op::Insert { reservations } => {
            for reservation in reservations {
                upsert_reservation(tx, reservation)?;
            }
            Ok(())
        }
        Op::Update { reservation } => upsert_reservation(tx, reservation),
        Op::CheckIn { record, reservation } => {
            upsert_reservation(tx, reservation)?;
            insert_check_in(tx, record)
        }
        Op::AddBlackout { blackout } => insert_blackout(tx, blackout),
        Op::RemoveBlackout { id } => {
            tx.execute("DELETE FROM blackouts WHERE id = ?1", params![*id as i64])?;
            Ok(())
        }
    }
}

fn upsert_resource(tx: &Transaction<'_>, resource: &Resource) -> PersistResult<()> {
    tx.execute(
        "INSERT INTO resources(id, facility_id, name, active) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
             facility_id = excluded.facility_id,
             name = excluded.name,
             active = excluded.active",
        params![
            resource.id as i64,
            resource.facility_id as i64,
            resource.name,
            resource.active,
        ],
    )?;
    Ok(())
}

fn upsert_reservation(tx: &Transaction<'_>, r: &Reservation) -> PersistResult<()> {
    tx.execute(
        "INSERT INTO reservations(
             id, resource_id, facility_id, date, start_time, end_time, status, payment,
             booked_by, notes, series_id, series_position, checked_in, checked_in_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(id) DO UPDATE SET
             resource_id = excluded.resource_id,
             facility_id = excluded.facility_id,
             date = excluded.date,
             start_time = excluded.start_time,
             end_time = excluded.end_time,
             status = excluded.status,
             payment = excluded.payment,
             notes = excluded.notes,
             checked_in = excluded.checked_in,
             checked_in_at = excluded.checked_in_at",
        params![
            r.id as i64,
            r.resource_id as i64,
            r.facility_id as i64,
            r.date.format(DATE_FMT).to_string(),
            r.range.start.format(TIME_FMT).to_string(),
            r.range.end.format(TIME_FMT).to_string(),
            r.status.as_str(),
            r.payment.as_str(),
            r.booked_by as i64,
            r.notes,
            r.series.as_ref().map(|s| s.series_id as i64),
            r.series.as_ref().map(|s| i64::from(s.position)),
            r.checked_in,
            r.checked_in_at.map(|t| t.format(DATETIME_FMT).to_string()),
        ],
    )?;
    Ok(())
}

fn insert_check_in(tx: &Transaction<'_>, record: &CheckInRecord) -> PersistResult<()> {
    tx.execute(
        "INSERT INTO check_ins(id, reservation_id, method, checked_in_at, actor_id, note, distance_m)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id as i64,
            record.reservation_id as i64,
            record.method.kind().as_str(),
            record.checked_in_at.format(DATETIME_FMT).to_string(),
            record.actor_id as i64,
            record.note,
            record.distance_m,
        ],
    )?;
    Ok(())
}

fn insert_blackout(tx: &Transaction<'_>, blackout: &Blackout) -> PersistResult<()> {
    tx.execute(
        "INSERT INTO blackouts(id, resource_id, date, start_time, end_time, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            blackout.id as i64,
            blackout.resource_id as i64,
            blackout.date.format(DATE_FMT).to_string(),
            blackout.range.start.format(TIME_FMT).to_string(),
            blackout.range.end.format(TIME_FMT).to_string(),
            blackout.reason,
        ],
    )?;
    Ok(())
}

fn subject_id(op: &Op) -> Option<u64> {
    match op {
        Op::UpsertResource { resource } => Some(resource.id),
        Op::Insert { reservations } => reservations.first().map(|r| r.id),
        Op::Update { reservation } => Some(reservation.id),
        Op::CheckIn { reservation, .. } => Some(reservation.id),
        Op::AddBlackout { blackout } => Some(blackout.id),
        Op::RemoveBlackout { id } => Some(*id),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn decode_stored_op_payload(payload: &[u8]) -> Result<StoredOp, String> {
    let envelope = serde_json::from_slice::<StoredOpEnvelope>(payload)
        .map_err(|e| format!("op payload decode failed: {e}"))?;
    if envelope.format_version != crate::op::OP_FORMAT_VERSION {
        return Err(format!(
            "unsupported op format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.stored)
}
