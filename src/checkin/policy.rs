use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{geo::Coordinate, types::FacilityId};

/// Circular area a geolocation check-in must fall inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub center: Coordinate,
    /// Radius in meters; the boundary itself is inside.
    pub radius_m: f64,
}

impl Geofence {
    pub fn distance_m(&self, point: &Coordinate) -> f64 {
        self.center.distance_m(point)
    }
}

/// Per-facility check-in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckInPolicy {
    /// Minutes before the start when check-in opens.
    pub minutes_before: u32,
    /// Minutes after the start when check-in closes.
    pub minutes_after: u32,
    /// Enforced for geolocation check-ins only.
    pub geofence: Option<Geofence>,
}

impl Default for CheckInPolicy {
    fn default() -> Self {
        Self {
            minutes_before: 30,
            minutes_after: 15,
            geofence: None,
        }
    }
}

/// Facility-configuration collaborator.
pub trait PolicySource: Send + Sync {
    fn policy_for(&self, facility: FacilityId) -> CheckInPolicy;
}

/// Fixed policy table with a fallback for unconfigured facilities.
///
/// Loadable from JSON:
/// ```
/// use courtbook::checkin::{PolicySource, StaticPolicies};
///
/// let policies = StaticPolicies::from_json_str(
///     r#"{"default":{"minutes_before":10},"facilities":{"7":{"minutes_after":5}}}"#,
/// ).expect("parse");
/// assert_eq!(policies.policy_for(1).minutes_before, 10);
/// assert_eq!(policies.policy_for(7).minutes_after, 5);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticPolicies {
    #[serde(default)]
    pub default: CheckInPolicy,
    #[serde(default)]
    pub facilities: HashMap<FacilityId, CheckInPolicy>,
}

impl StaticPolicies {
    pub fn uniform(policy: CheckInPolicy) -> Self {
        Self {
            default: policy,
            facilities: HashMap::new(),
        }
    }

    pub fn with_facility(mut self, facility: FacilityId, policy: CheckInPolicy) -> Self {
        self.facilities.insert(facility, policy);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl PolicySource for StaticPolicies {
    fn policy_for(&self, facility: FacilityId) -> CheckInPolicy {
        self.facilities
            .get(&facility)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
