//! Error taxonomy returned by every booking and check-in operation.

use std::fmt;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::{
    core::conflict::Conflict,
    persist::PersistError,
    qr::QrError,
    types::{BlackoutId, ReservationId, ResourceId, SeriesId},
};

/// Entity a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Reservation(ReservationId),
    Resource(ResourceId),
    Blackout(BlackoutId),
    Series(SeriesId),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reservation(id) => write!(f, "reservation {id}"),
            Self::Resource(id) => write!(f, "resource {id}"),
            Self::Blackout(id) => write!(f, "blackout {id}"),
            Self::Series(id) => write!(f, "series {id}"),
        }
    }
}

/// Failure of a booking or check-in operation.
#[derive(Debug, Error)]
pub enum BookingError {
    /// The requested slot overlaps an active reservation or blackout.
    #[error("slot conflict: {0}")]
    Conflict(Box<Conflict>),
    /// Malformed request.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The target resource accepts no new bookings.
    #[error("resource {0} is inactive")]
    ResourceInactive(ResourceId),
    /// Check-in attempted outside the reservation's window.
    #[error(
        "check-in for reservation {reservation_id} at {attempted_at} is outside the window {opens_at} to {closes_at}"
    )]
    WindowClosed {
        reservation_id: ReservationId,
        attempted_at: NaiveDateTime,
        opens_at: NaiveDateTime,
        closes_at: NaiveDateTime,
    },
    /// Geolocation check-in outside the facility geofence.
    #[error(
        "check-in for reservation {reservation_id} is {distance_m:.0} m from the facility, allowed {radius_m:.0} m"
    )]
    Geofence {
        reservation_id: ReservationId,
        /// Measured distance to the geofence center.
        distance_m: f64,
        /// Allowed radius.
        radius_m: f64,
    },
    /// The reservation has already been checked in.
    #[error("reservation {reservation_id} was already checked in at {checked_in_at}")]
    AlreadyCheckedIn {
        reservation_id: ReservationId,
        checked_in_at: NaiveDateTime,
    },
    /// The reservation is cancelled and cannot be edited or checked in.
    #[error("reservation {0} is cancelled")]
    ReservationCancelled(ReservationId),
    /// Unknown entity.
    #[error("{0} not found")]
    NotFound(Missing),
    /// Scanned QR payload could not be decoded.
    #[error("invalid qr code: {0}")]
    InvalidQr(#[from] QrError),
    /// Storage collaborator failure, surfaced as-is.
    #[error("storage error: {0}")]
    Storage(#[from] PersistError),
    /// The runtime task has stopped.
    #[error("booking runtime is not running")]
    ChannelClosed,
}

impl From<Conflict> for BookingError {
    fn from(value: Conflict) -> Self {
        Self::Conflict(Box::new(value))
    }
}

impl BookingError {
    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            Self::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

pub type BookingResult<T> = Result<T, BookingError>;
