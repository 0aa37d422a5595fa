use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::cities::City;
use crate::cities_repo::CitiesRepository;
use crate::gateway::{FleetGateway, GatewayError, GatewayResult};
use crate::planes::{Plane, PlaneSnapshot, StatisticsUpdate};
use crate::planes_repo::PlanesRepository;

type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Build the shared r2d2 pool used by every repository
pub fn create_pool(database_url: &str, max_size: u32, timeout: Duration) -> Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(timeout)
        .build(manager)
        .context("Failed to create PostgreSQL connection pool")?;
    info!("PostgreSQL pool ready (max {} connections)", max_size);
    Ok(pool)
}

/// [`FleetGateway`] backed by the `cities` and `planes` tables
#[derive(Clone)]
pub struct PgFleetGateway {
    cities_repo: CitiesRepository,
    planes_repo: PlanesRepository,
}

impl PgFleetGateway {
    pub fn new(pool: PgPool) -> Self {
        Self {
            cities_repo: CitiesRepository::new(pool.clone()),
            planes_repo: PlanesRepository::new(pool),
        }
    }
}

/// Decode failures are permanent; anything else (pool timeout, dropped
/// connection, server error) is treated as the store being unavailable.
fn classify(key: &str, error: anyhow::Error) -> GatewayError {
    match error.downcast_ref::<diesel::result::Error>() {
        Some(diesel::result::Error::DeserializationError(reason)) => GatewayError::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        },
        _ => GatewayError::Unavailable(error),
    }
}

#[async_trait]
impl FleetGateway for PgFleetGateway {
    async fn get_cities_by_ids(&self, ids: &[String]) -> GatewayResult<HashMap<String, City>> {
        let cities = self
            .cities_repo
            .get_by_ids(ids.to_vec())
            .await
            .map_err(|e| classify("cities", e))?;
        Ok(cities.into_iter().map(|c| (c.id.clone(), c)).collect())
    }

    async fn get_plane_statistics(&self, plane_id: &str) -> GatewayResult<Option<PlaneSnapshot>> {
        self.planes_repo
            .get_statistics(plane_id.to_string())
            .await
            .map_err(|e| classify(plane_id, e))
    }

    async fn update_plane_statistics(
        &self,
        plane_id: &str,
        update: &StatisticsUpdate,
    ) -> GatewayResult<bool> {
        self.planes_repo
            .update_statistics(plane_id.to_string(), update.clone())
            .await
            .map_err(|e| classify(plane_id, e))
    }

    async fn get_plane(&self, plane_id: &str) -> GatewayResult<Option<Plane>> {
        self.planes_repo
            .get_by_id(plane_id.to_string())
            .await
            .map_err(|e| classify(plane_id, e))
    }
}
