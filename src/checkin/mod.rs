//! Check-in verification: per-facility policy, window and geofence rules.

/// Facility check-in policy and its configuration source.
pub mod policy;
/// Eligibility state machine and admission checks.
pub mod verifier;

pub use policy::{CheckInPolicy, Geofence, PolicySource, StaticPolicies};
pub use verifier::{
    evaluate, verify, CheckInMethod, CheckInMethodKind, CheckInRecord, CheckInRequest,
    CheckInState, CheckInWindow, Ineligibility, Verified,
};
