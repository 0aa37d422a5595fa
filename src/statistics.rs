use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Distance since the last maintenance above which a plane is flagged for maintenance
pub const MAINTENANCE_THRESHOLD_MILES: f64 = 50_000.0;

/// Cumulative flight statistics for a single plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaneStatistics {
    #[serde(default)]
    pub total_distance_miles: f64,
    #[serde(default)]
    pub distance_since_maintenance_miles: f64,
    /// Latch: once set it is only cleared by the external maintenance workflow
    #[serde(default)]
    pub maintenance_required: bool,
    #[serde(default)]
    pub airtime_minutes: f64,
}

impl PlaneStatistics {
    /// Fold one completed leg into the statistics
    ///
    /// While `maintenance_required` is set the distance since maintenance is
    /// frozen; totals and airtime keep accumulating. Negative or non-finite
    /// inputs contribute nothing, so totals never decrease.
    pub fn apply_leg(&self, leg_distance_miles: f64, elapsed_minutes: f64) -> PlaneStatistics {
        let leg = non_negative(leg_distance_miles);
        let elapsed = non_negative(elapsed_minutes);

        let (distance_since_maintenance_miles, maintenance_required) = if self.maintenance_required
        {
            (self.distance_since_maintenance_miles, true)
        } else {
            let since = self.distance_since_maintenance_miles + leg;
            (since, since > MAINTENANCE_THRESHOLD_MILES)
        };

        PlaneStatistics {
            total_distance_miles: self.total_distance_miles + leg,
            distance_since_maintenance_miles,
            maintenance_required,
            airtime_minutes: self.airtime_minutes + elapsed,
        }
    }
}

/// Free-function form of [`PlaneStatistics::apply_leg`]
pub fn apply_leg(
    current: &PlaneStatistics,
    leg_distance_miles: f64,
    elapsed_minutes: f64,
) -> PlaneStatistics {
    current.apply_leg(leg_distance_miles, elapsed_minutes)
}

/// Minutes elapsed between the previous landing transition and this landing
///
/// Returns 0 when there is no previous timestamp or the clock went backwards.
pub fn elapsed_minutes_between(previous: Option<DateTime<Utc>>, landed_on: DateTime<Utc>) -> f64 {
    match previous {
        Some(previous) => {
            let millis = landed_on.signed_duration_since(previous).num_milliseconds();
            (millis as f64 / 60_000.0).max(0.0)
        }
        None => 0.0,
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
