use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

/// A city planes fly between. Reference data, never written by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct City {
    #[serde(alias = "_id")]
    pub id: String,
    pub country: String,
    pub position: GeoPoint,
}

impl City {
    pub fn new(id: impl Into<String>, country: impl Into<String>, position: GeoPoint) -> Self {
        Self {
            id: id.into(),
            country: country.into(),
            position,
        }
    }
}
