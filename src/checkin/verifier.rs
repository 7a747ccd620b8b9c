use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::{
    error::BookingError,
    geo::Coordinate,
    reservation::Reservation,
    types::{ActorId, CheckInId, ReservationId},
};

use super::policy::CheckInPolicy;

/// How the guest is checking in.
///
/// Only [`CheckInMethod::Geolocation`] carries a device position, and only it
/// is held to the facility geofence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum CheckInMethod {
    /// Staff-assisted check-in at the desk.
    Manual,
    /// Scanned reservation QR code.
    QrCode,
    /// Self check-in from the guest's device position.
    Geolocation {
        /// Reported device position.
        position: Coordinate,
    },
}

/// Method without its payload, for events and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInMethodKind {
    Manual,
    QrCode,
    Geolocation,
}

impl CheckInMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::QrCode => "qrcode",
            Self::Geolocation => "geolocation",
        }
    }
}

impl CheckInMethod {
    pub fn kind(&self) -> CheckInMethodKind {
        match self {
            Self::Manual => CheckInMethodKind::Manual,
            Self::QrCode => CheckInMethodKind::QrCode,
            Self::Geolocation { .. } => CheckInMethodKind::Geolocation,
        }
    }
}

/// Inclusive interval during which a reservation accepts check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInWindow {
    pub opens_at: NaiveDateTime,
    pub closes_at: NaiveDateTime,
}

impl CheckInWindow {
    /// Window `[start - before, start + after]` around the reservation start.
    pub fn for_reservation(reservation: &Reservation, policy: &CheckInPolicy) -> Self {
        let start = reservation.starts_at();
        Self {
            opens_at: start - TimeDelta::minutes(i64::from(policy.minutes_before)),
            closes_at: start + TimeDelta::minutes(i64::from(policy.minutes_after)),
        }
    }

    /// True when `now` lies inside the window, boundaries included.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        self.opens_at <= now && now <= self.closes_at
    }
}

/// Why a reservation cannot be checked in right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ineligibility {
    /// The window has not opened yet.
    TooEarly,
    /// The window has closed.
    TooLate,
    /// The reservation was cancelled.
    Cancelled,
}

/// Check-in state of a reservation at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckInState {
    /// Outside the window, or cancelled.
    NotEligible {
        reason: Ineligibility,
        window: CheckInWindow,
    },
    /// Inside the window and not checked in.
    Eligible {
        window: CheckInWindow,
    },
    /// Terminal.
    CheckedIn {
        at: NaiveDateTime,
    },
}

/// Derives the state of `reservation` at `now`. Nothing is cached; callers
/// re-evaluate on every attempt.
pub fn evaluate(reservation: &Reservation, policy: &CheckInPolicy, now: NaiveDateTime) -> CheckInState {
    if reservation.checked_in {
        return CheckInState::CheckedIn {
            at: reservation.checked_in_at.unwrap_or(now),
        };
    }

    let window = CheckInWindow::for_reservation(reservation, policy);
    if !reservation.is_active() {
        return CheckInState::NotEligible {
            reason: Ineligibility::Cancelled,
            window,
        };
    }
    if now < window.opens_at {
        CheckInState::NotEligible {
            reason: Ineligibility::TooEarly,
            window,
        }
    } else if now > window.closes_at {
        CheckInState::NotEligible {
            reason: Ineligibility::TooLate,
            window,
        }
    } else {
        CheckInState::Eligible { window }
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verified {
    /// Distance to the geofence center, when one was checked.
    pub distance_m: Option<f64>,
}

/// Decides whether `method` may check `reservation` in at `now`.
///
/// Pure; the caller records the outcome under its own compare-and-set.
pub fn verify(
    reservation: &Reservation,
    policy: &CheckInPolicy,
    method: &CheckInMethod,
    now: NaiveDateTime,
) -> Result<Verified, BookingError> {
    match evaluate(reservation, policy, now) {
        CheckInState::CheckedIn { at } => {
            return Err(BookingError::AlreadyCheckedIn {
                reservation_id: reservation.id,
                checked_in_at: at,
            });
        }
        CheckInState::NotEligible {
            reason: Ineligibility::Cancelled,
            ..
        } => return Err(BookingError::ReservationCancelled(reservation.id)),
        CheckInState::NotEligible { window, .. } => {
            return Err(BookingError::WindowClosed {
                reservation_id: reservation.id,
                attempted_at: now,
                opens_at: window.opens_at,
                closes_at: window.closes_at,
            });
        }
        CheckInState::Eligible { .. } => {}
    }

    let (CheckInMethod::Geolocation { position }, Some(fence)) = (method, policy.geofence) else {
        return Ok(Verified { distance_m: None });
    };

    let distance_m = fence.distance_m(position);
    if distance_m > fence.radius_m {
        return Err(BookingError::Geofence {
            reservation_id: reservation.id,
            distance_m,
            radius_m: fence.radius_m,
        });
    }
    Ok(Verified {
        distance_m: Some(distance_m),
    })
}

/// Check-in attempt as submitted by staff, scanner, or device.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInRequest {
    pub reservation_id: ReservationId,
    pub method: CheckInMethod,
    pub actor_id: ActorId,
    pub note: String,
}

/// Audit record appended exactly once per successful check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub id: CheckInId,
    pub reservation_id: ReservationId,
    pub method: CheckInMethod,
    pub checked_in_at: NaiveDateTime,
    pub actor_id: ActorId,
    pub note: String,
    /// Distance to the geofence center, when one was checked.
    pub distance_m: Option<f64>,
}
