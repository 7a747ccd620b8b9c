//! Resource, reservation, draft, patch, and blackout records.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{
    core::indices::SlotKey,
    recurrence::RecurrenceRule,
    types::{
        ActorId, BlackoutId, FacilityId, PaymentStatus, ReservationId, ReservationStatus,
        ResourceId, SeriesId, TimeRange,
    },
};

/// A bookable court.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub facility_id: FacilityId,
    pub name: String,
    /// Inactive resources accept no new bookings.
    pub active: bool,
}

/// Recurrence metadata carried by every occurrence of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub series_id: SeriesId,
    pub position: u32,
    /// Rule the series was expanded from.
    pub rule: RecurrenceRule,
}

/// Fully materialized, authoritative reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub resource_id: ResourceId,
    /// Facility of the booked resource at booking/edit time.
    pub facility_id: FacilityId,
    pub date: NaiveDate,
    /// Wall-clock range on `date`.
    pub range: TimeRange,
    pub status: ReservationStatus,
    /// Payment status, not consulted by conflict checks.
    pub payment: PaymentStatus,
    pub booked_by: ActorId,
    pub notes: String,
    /// Present when generated from a recurrence rule.
    pub series: Option<SeriesInfo>,
    /// True once a check-in has been recorded.
    pub checked_in: bool,
    /// Moment of the successful check-in.
    pub checked_in_at: Option<NaiveDateTime>,
}

impl Reservation {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.resource_id, self.date)
    }

    /// True unless cancelled.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.start)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.range.end)
    }
}

/// Insert payload used to create a new [`Reservation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    pub resource_id: ResourceId,
    /// Booking date (first occurrence for a series).
    pub date: NaiveDate,
    pub range: TimeRange,
    pub booked_by: ActorId,
    pub payment: PaymentStatus,
    pub notes: String,
}

/// Sparse edit where each `Some` field overwrites the record value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReservationPatch {
    pub resource_id: Option<ResourceId>,
    pub date: Option<NaiveDate>,
    pub range: Option<TimeRange>,
    pub payment: Option<PaymentStatus>,
    pub notes: Option<String>,
    /// Promote to confirmed (or back to pending). Cancellation goes through `cancel`.
    pub status: Option<ReservationStatus>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// True when the patch changes resource, date, or time range.
    pub fn moves_slot(&self) -> bool {
        self.resource_id.is_some() || self.date.is_some() || self.range.is_some()
    }

    pub fn apply_to(&self, rec: &mut Reservation) {
        if let Some(v) = self.resource_id {
            rec.resource_id = v;
        }
        if let Some(v) = self.date {
            rec.date = v;
        }
        if let Some(v) = self.range {
            rec.range = v;
        }
        if let Some(v) = self.payment {
            rec.payment = v;
        }
        if let Some(v) = &self.notes {
            rec.notes = v.clone();
        }
        if let Some(v) = self.status {
            rec.status = v;
        }
    }
}

/// Maintenance period that blocks a resource like a synthetic reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blackout {
    pub id: BlackoutId,
    pub resource_id: ResourceId,
    pub date: NaiveDate,
    pub range: TimeRange,
    /// Why the resource is unavailable.
    pub reason: String,
}

impl Blackout {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.resource_id, self.date)
    }
}
