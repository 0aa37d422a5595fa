use async_trait::async_trait;
use std::collections::HashMap;

use crate::cities::City;
use crate::planes::{Plane, PlaneSnapshot, StatisticsUpdate};

/// Errors surfaced by a fleet store
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Connectivity, pool exhaustion or timeout. Worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    /// The store answered with data that cannot be decoded
    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Store access used by the aggregator
///
/// Implementations must be safe for concurrent use; every plane write is a
/// single atomic operation on one plane.
#[async_trait]
pub trait FleetGateway: Send + Sync {
    /// Batch city lookup. Unknown ids are simply absent from the result.
    async fn get_cities_by_ids(&self, ids: &[String]) -> GatewayResult<HashMap<String, City>>;

    /// Statistics and watermark of a plane, `None` if the plane does not exist
    async fn get_plane_statistics(&self, plane_id: &str) -> GatewayResult<Option<PlaneSnapshot>>;

    /// Conditionally write new statistics
    ///
    /// Returns `false` without writing when the stored watermark no longer
    /// equals `update.expected_as_of` (or the plane is gone).
    async fn update_plane_statistics(
        &self,
        plane_id: &str,
        update: &StatisticsUpdate,
    ) -> GatewayResult<bool>;

    /// Full plane document, used when a change notification carries only a key
    async fn get_plane(&self, plane_id: &str) -> GatewayResult<Option<Plane>>;
}
