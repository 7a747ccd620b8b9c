//! Mutation operation model and persistence wrappers.
//!
//! Ops carry post-images so replay and SQLite materialization never need the
//! prior row.

use serde::{Deserialize, Serialize};

use crate::{
    checkin::CheckInRecord,
    reservation::{Blackout, Reservation, Resource},
    types::{BlackoutId, OpSeq},
};

/// Version number for serialized [`StoredOpEnvelope`] payloads.
pub const OP_FORMAT_VERSION: u16 = 1;

/// Immutable operation appended to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Register or replace a resource.
    UpsertResource {
        resource: Resource,
    },
    /// Insert one reservation, or every occurrence of a series at once.
    Insert {
        reservations: Vec<Reservation>,
    },
    /// Replace a reservation after an edit or cancellation.
    Update {
        reservation: Reservation,
    },
    /// Record a check-in together with the promoted reservation.
    CheckIn {
        record: CheckInRecord,
        reservation: Reservation,
    },
    /// Block a slot for maintenance.
    AddBlackout {
        blackout: Blackout,
    },
    /// Lift a blackout.
    RemoveBlackout {
        id: BlackoutId,
    },
}

impl Op {
    /// Stable numeric kind used by the journal table.
    pub fn kind(&self) -> i64 {
        match self {
            Op::UpsertResource { .. } => 1,
            Op::Insert { .. } => 2,
            Op::Update { .. } => 3,
            Op::CheckIn { .. } => 4,
            Op::AddBlackout { .. } => 5,
            Op::RemoveBlackout { .. } => 6,
        }
    }
}

/// Journal row metadata plus operation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOp {
    pub seq: OpSeq,
    pub ts_ms: u64,
    pub op: Op,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOpEnvelope {
    pub format_version: u16,
    pub stored: StoredOp,
}

impl StoredOpEnvelope {
    pub fn new(stored: StoredOp) -> Self {
        Self {
            format_version: OP_FORMAT_VERSION,
            stored,
        }
    }
}
