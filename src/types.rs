//! Shared primitive IDs, status enums, and the wall-clock time range.

use std::fmt;

use chrono::{NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::BookingError;

pub type ReservationId = u64;
pub type ResourceId = u64;
/// Facility identifier; check-in policy is configured per facility.
pub type FacilityId = u64;
/// Identifier of the user or staff member performing an operation.
pub type ActorId = u64;
/// Identifier shared by every reservation of one recurrence series.
pub type SeriesId = u64;
pub type BlackoutId = u64;
pub type CheckInId = u64;
/// Monotonic operation sequence number.
pub type OpSeq = u64;

/// Reservation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Booked, not yet confirmed.
    Pending,
    /// Confirmed, either by staff or by a successful check-in.
    Confirmed,
    /// Soft-cancelled; the slot is free again.
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    /// True for every status that occupies the slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Payment axis, independent of the lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Nothing paid yet.
    #[default]
    Unpaid,
    /// Deposit or partial amount received.
    Partial,
    /// Fully paid.
    Paid,
    /// Payment returned after cancellation.
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
        }
    }
}

/// Half-open wall-clock range `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    /// Builds a range, rejecting empty and inverted ranges.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, BookingError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Builds a range from `(hour, minute)` pairs.
    pub fn hm(start: (u32, u32), end: (u32, u32)) -> Result<Self, BookingError> {
        let to_time = |(h, m): (u32, u32)| {
            NaiveTime::from_hms_opt(h, m, 0)
                .ok_or_else(|| BookingError::Validation(format!("invalid time {h:02}:{m:02}")))
        };
        Self::new(to_time(start)?, to_time(end)?)
    }

    /// Fails unless `end > start`.
    pub fn validate(&self) -> Result<(), BookingError> {
        if self.end <= self.start {
            return Err(BookingError::Validation(format!(
                "time range {self} must end after it starts"
            )));
        }
        Ok(())
    }

    /// Half-open overlap test; touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}
