use serde::{Deserialize, Serialize};

/// Mean Earth radius used for all leg distances, in statute miles
pub const EARTH_RADIUS_MILES: f64 = 3959.87433;

/// A WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to another point in miles
    pub fn distance_miles_to(&self, other: &GeoPoint) -> f64 {
        great_circle_distance_miles(self, other)
    }
}

/// Calculate the great-circle distance between two points using the Haversine formula
/// Returns distance in miles
///
/// `sqrt(a)` is clamped to 1.0 before `asin` so floating-point overshoot on
/// near-antipodal points cannot produce NaN.
pub fn great_circle_distance_miles(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1_rad = a.latitude.to_radians();
    let lat2_rad = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().clamp(0.0, 1.0).asin();

    EARTH_RADIUS_MILES * c
}
