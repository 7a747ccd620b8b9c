//! Check-in token carried by reservation QR codes.
//!
//! A token is `v1.<base64url(json)>`. It is neither signed nor expiring:
//! whether a scan is admissible is re-derived from the reservation's own
//! check-in window, so a stale or replayed code is rejected by verification,
//! not by decoding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ReservationId;

const TOKEN_VERSION_V1: &str = "v1";
const MAX_TOKEN_LEN: usize = 512;

/// Decoded QR payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrToken {
    pub reservation_id: ReservationId,
    pub issued_at: NaiveDateTime,
}

/// Malformed QR payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QrError {
    /// Nothing was scanned.
    #[error("empty qr payload")]
    Empty,
    /// Payload longer than any token this crate issues.
    #[error("qr payload exceeds {MAX_TOKEN_LEN} bytes")]
    TooLong,
    /// Missing or unknown version prefix.
    #[error("unsupported qr token version {0:?}")]
    UnsupportedVersion(String),
    /// Body is not base64url.
    #[error("qr token body is not valid base64url")]
    InvalidEncoding,
    /// Body decoded but is not a token.
    #[error("qr token payload is invalid: {0}")]
    InvalidPayload(String),
}

impl QrToken {
    pub fn new(reservation_id: ReservationId, issued_at: NaiveDateTime) -> Self {
        Self {
            reservation_id,
            issued_at,
        }
    }
}

/// Encodes `token` into the string rendered as a QR code.
pub fn encode(token: &QrToken) -> Result<String, QrError> {
    let payload = serde_json::to_vec(token).map_err(|e| QrError::InvalidPayload(e.to_string()))?;
    Ok(format!("{TOKEN_VERSION_V1}.{}", URL_SAFE_NO_PAD.encode(payload)))
}

/// Decodes a scanned string back into a [`QrToken`].
pub fn decode(raw: &str) -> Result<QrToken, QrError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(QrError::Empty);
    }
    if raw.len() > MAX_TOKEN_LEN {
        return Err(QrError::TooLong);
    }

    let Some((version, body)) = raw.split_once('.') else {
        return Err(QrError::UnsupportedVersion(String::new()));
    };
    if version != TOKEN_VERSION_V1 {
        return Err(QrError::UnsupportedVersion(version.to_string()));
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| QrError::InvalidEncoding)?;
    serde_json::from_slice(&bytes).map_err(|e| QrError::InvalidPayload(e.to_string()))
}
