//! Domain events for the notification collaborator.

use crate::{
    checkin::CheckInMethodKind,
    types::{ActorId, OpSeq, ReservationId, SeriesId},
};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingEvent {
    /// A single reservation was booked.
    ReservationCreated {
        reservation_id: ReservationId,
        actor_id: ActorId,
    },
    /// A whole recurrence series was booked.
    SeriesCreated {
        series_id: SeriesId,
        reservation_ids: Vec<ReservationId>,
        actor_id: ActorId,
    },
    /// A reservation was edited.
    ReservationEdited {
        reservation_id: ReservationId,
        actor_id: ActorId,
    },
    /// A reservation went from active to cancelled.
    ReservationCancelled {
        reservation_id: ReservationId,
        actor_id: ActorId,
    },
    /// A check-in was recorded.
    CheckedIn {
        reservation_id: ReservationId,
        actor_id: ActorId,
        method: CheckInMethodKind,
    },
    /// Persistence has reached at least this op sequence.
    DurableUpTo {
        op_seq: OpSeq,
    },
}

impl BookingEvent {
    /// Event type name handed to notification delivery.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReservationCreated { .. } => "reservation_created",
            Self::SeriesCreated { .. } => "series_created",
            Self::ReservationEdited { .. } => "reservation_edited",
            Self::ReservationCancelled { .. } => "reservation_cancelled",
            Self::CheckedIn { .. } => "checked_in",
            Self::DurableUpTo { .. } => "durable_up_to",
        }
    }

    /// Acting user, for domain events.
    pub fn actor_id(&self) -> Option<ActorId> {
        match self {
            Self::ReservationCreated { actor_id, .. }
            | Self::SeriesCreated { actor_id, .. }
            | Self::ReservationEdited { actor_id, .. }
            | Self::ReservationCancelled { actor_id, .. }
            | Self::CheckedIn { actor_id, .. } => Some(*actor_id),
            Self::DurableUpTo { .. } => None,
        }
    }
}
