use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    reservation::{Blackout, Reservation},
    types::{BlackoutId, ReservationId, ResourceId, TimeRange},
};

/// What a requested range collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collision {
    /// An active reservation.
    Reservation(ReservationId),
    /// A maintenance blackout.
    Blackout(BlackoutId),
    /// An earlier occurrence of the same series request.
    SeriesOccurrence(u32),
}

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reservation(id) => write!(f, "reservation {id}"),
            Self::Blackout(id) => write!(f, "blackout {id}"),
            Self::SeriesOccurrence(pos) => write!(f, "occurrence {pos} of the same series"),
        }
    }
}

/// Structured conflict detail returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub resource_id: ResourceId,
    pub date: NaiveDate,
    pub requested: TimeRange,
    /// 1-based series position of the rejected occurrence, for series requests.
    pub occurrence: Option<u32>,
    /// What the request collided with.
    pub collides_with: Collision,
    /// Range held by the colliding entry.
    pub colliding_range: TimeRange,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pos) = self.occurrence {
            write!(f, "occurrence {pos}: ")?;
        }
        write!(
            f,
            "resource {} on {} {} overlaps {} ({})",
            self.resource_id, self.date, self.requested, self.collides_with, self.colliding_range
        )
    }
}

/// Returns the first active reservation or blackout overlapping `range`.
///
/// `reservations` and `blackouts` must already be restricted to one
/// `(resource, date)` slot. Cancelled reservations and `exclude` are skipped.
pub fn find_overlap<'a>(
    range: &TimeRange,
    reservations: impl IntoIterator<Item = &'a Reservation>,
    blackouts: impl IntoIterator<Item = &'a Blackout>,
    exclude: Option<ReservationId>,
) -> Option<(Collision, TimeRange)> {
    let booked = reservations
        .into_iter()
        .filter(|r| r.is_active() && Some(r.id) != exclude)
        .find(|r| range.overlaps(&r.range))
        .map(|r| (Collision::Reservation(r.id), r.range));

    booked.or_else(|| {
        blackouts
            .into_iter()
            .find(|b| range.overlaps(&b.range))
            .map(|b| (Collision::Blackout(b.id), b.range))
    })
}

/// Read-only conflict predicate over one slot's entries.
pub fn has_conflict<'a>(
    range: &TimeRange,
    reservations: impl IntoIterator<Item = &'a Reservation>,
    blackouts: impl IntoIterator<Item = &'a Blackout>,
    exclude: Option<ReservationId>,
) -> bool {
    find_overlap(range, reservations, blackouts, exclude).is_some()
}
