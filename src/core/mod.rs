//! In-memory authoritative store and index helpers.

/// Half-open overlap rules against reservations and blackouts.
pub mod conflict;
/// Slot index keyed by resource and date.
pub mod indices;
/// Authoritative reservation store.
pub mod store;
