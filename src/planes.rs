use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::statistics::PlaneStatistics;

/// Typed plane document as stored and as carried by change notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plane {
    #[serde(alias = "_id")]
    pub id: String,
    pub current_location: GeoPoint,
    /// Heading in degrees
    #[serde(default)]
    pub heading: f64,
    /// Remaining destinations, front is the next one
    #[serde(default)]
    pub route: Vec<String>,
    #[serde(default)]
    pub departed_from: Option<String>,
    /// City the plane is on the ground at; `None` while airborne
    #[serde(default)]
    pub landed_at: Option<String>,
    #[serde(default)]
    pub landed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub statistics: PlaneStatistics,
    /// `landed_on` of the latest landing already folded into `statistics`
    #[serde(default)]
    pub statistics_as_of: Option<DateTime<Utc>>,
}

impl Plane {
    /// A freshly registered plane parked at `city_id` with zeroed statistics
    pub fn registered_at(
        id: impl Into<String>,
        city_id: impl Into<String>,
        location: GeoPoint,
        landed_on: DateTime<Utc>,
    ) -> Self {
        let city_id = city_id.into();
        Self {
            id: id.into(),
            current_location: location,
            heading: 0.0,
            route: Vec::new(),
            departed_from: Some(city_id.clone()),
            landed_at: Some(city_id),
            landed_on: Some(landed_on),
            statistics: PlaneStatistics::default(),
            statistics_as_of: Some(landed_on),
        }
    }

    /// Start an unset watermark at the plane's last transition
    ///
    /// Must run before `landed_on` is overwritten by a new landing, so the
    /// first leg's airtime is measured from registration.
    pub fn seed_statistics_as_of(&mut self) {
        if self.statistics_as_of.is_none() {
            self.statistics_as_of = self.landed_on;
        }
    }

    pub fn is_airborne(&self) -> bool {
        self.landed_at.is_none()
    }

    /// Landing event described by this document, if the plane is on the ground
    ///
    /// Returns `None` for airborne planes (a departure also changes `landedAt`)
    /// and for documents without a landing timestamp.
    pub fn landing_event(&self, sequence: u64) -> Option<LandingEvent> {
        let landed_at = self.landed_at.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
        let landed_on = self.landed_on?;
        Some(LandingEvent {
            plane_id: self.id.clone(),
            departed_from: self
                .departed_from
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            landed_at: landed_at.to_string(),
            landed_on,
            sequence,
        })
    }

    pub fn snapshot(&self) -> PlaneSnapshot {
        PlaneSnapshot {
            statistics: self.statistics,
            previous_landed_on: self.statistics_as_of,
        }
    }
}

/// A plane transitioning from airborne to landed at a city
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandingEvent {
    pub plane_id: String,
    pub departed_from: Option<String>,
    pub landed_at: String,
    pub landed_on: DateTime<Utc>,
    /// Feed position the event was decoded from
    pub sequence: u64,
}

/// The part of a plane the aggregator reads before computing a leg
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneSnapshot {
    pub statistics: PlaneStatistics,
    /// `landed_on` of the last landing counted into `statistics`
    pub previous_landed_on: Option<DateTime<Utc>>,
}

/// Conditional statistics write for one plane
///
/// Applied only if the stored watermark still equals `expected_as_of`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsUpdate {
    pub statistics: PlaneStatistics,
    pub departed_from: String,
    pub statistics_as_of: DateTime<Utc>,
    pub expected_as_of: Option<DateTime<Utc>>,
}
