use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::expression_methods::PgExpressionMethods;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use tracing::debug;

use crate::geo::GeoPoint;
use crate::planes::{Plane, PlaneSnapshot, StatisticsUpdate};
use crate::schema::planes;
use crate::statistics::PlaneStatistics;

type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Full row of the planes table
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = planes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PlaneRecord {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: f64,
    pub route: Vec<String>,
    pub departed_from: Option<String>,
    pub landed_at: Option<String>,
    pub landed_on: Option<DateTime<Utc>>,
    pub total_distance_miles: f64,
    pub distance_since_maintenance_miles: f64,
    pub maintenance_required: bool,
    pub airtime_minutes: f64,
    pub statistics_as_of: Option<DateTime<Utc>>,
}

/// Insert model used when registering planes
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = planes)]
pub struct NewPlaneRecord {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: f64,
    pub route: Vec<String>,
    pub departed_from: Option<String>,
    pub landed_at: Option<String>,
    pub landed_on: Option<DateTime<Utc>>,
    pub total_distance_miles: f64,
    pub distance_since_maintenance_miles: f64,
    pub maintenance_required: bool,
    pub airtime_minutes: f64,
    pub statistics_as_of: Option<DateTime<Utc>>,
}

/// Only the columns the aggregator needs before computing a leg
#[derive(Queryable, Selectable, Debug, Clone, Copy)]
#[diesel(table_name = planes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct PlaneStatisticsRecord {
    total_distance_miles: f64,
    distance_since_maintenance_miles: f64,
    maintenance_required: bool,
    airtime_minutes: f64,
    statistics_as_of: Option<DateTime<Utc>>,
}

impl From<PlaneStatisticsRecord> for PlaneSnapshot {
    fn from(record: PlaneStatisticsRecord) -> Self {
        PlaneSnapshot {
            statistics: PlaneStatistics {
                total_distance_miles: record.total_distance_miles,
                distance_since_maintenance_miles: record.distance_since_maintenance_miles,
                maintenance_required: record.maintenance_required,
                airtime_minutes: record.airtime_minutes,
            },
            previous_landed_on: record.statistics_as_of,
        }
    }
}

impl From<PlaneRecord> for Plane {
    fn from(record: PlaneRecord) -> Self {
        Plane {
            id: record.id,
            current_location: GeoPoint::new(record.latitude, record.longitude),
            heading: record.heading,
            route: record.route,
            departed_from: record.departed_from,
            landed_at: record.landed_at,
            landed_on: record.landed_on,
            statistics: PlaneStatistics {
                total_distance_miles: record.total_distance_miles,
                distance_since_maintenance_miles: record.distance_since_maintenance_miles,
                maintenance_required: record.maintenance_required,
                airtime_minutes: record.airtime_minutes,
            },
            statistics_as_of: record.statistics_as_of,
        }
    }
}

impl From<&Plane> for NewPlaneRecord {
    fn from(plane: &Plane) -> Self {
        NewPlaneRecord {
            id: plane.id.clone(),
            latitude: plane.current_location.latitude,
            longitude: plane.current_location.longitude,
            heading: plane.heading,
            route: plane.route.clone(),
            departed_from: plane.departed_from.clone(),
            landed_at: plane.landed_at.clone(),
            landed_on: plane.landed_on,
            total_distance_miles: plane.statistics.total_distance_miles,
            distance_since_maintenance_miles: plane.statistics.distance_since_maintenance_miles,
            maintenance_required: plane.statistics.maintenance_required,
            airtime_minutes: plane.statistics.airtime_minutes,
            statistics_as_of: plane.statistics_as_of,
        }
    }
}

#[derive(Clone)]
pub struct PlanesRepository {
    pool: PgPool,
}

impl PlanesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, plane_id: String) -> Result<Option<Plane>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Plane>> {
            let mut conn = pool.get()?;
            let record = planes::table
                .find(&plane_id)
                .select(PlaneRecord::as_select())
                .first::<PlaneRecord>(&mut conn)
                .optional()?;
            Ok(record.map(Plane::from))
        })
        .await?
    }

    pub async fn get_statistics(&self, plane_id: String) -> Result<Option<PlaneSnapshot>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<PlaneSnapshot>> {
            let mut conn = pool.get()?;
            let record = planes::table
                .find(&plane_id)
                .select(PlaneStatisticsRecord::as_select())
                .first::<PlaneStatisticsRecord>(&mut conn)
                .optional()?;
            Ok(record.map(PlaneSnapshot::from))
        })
        .await?
    }

    /// Single-statement compare-and-set on the statistics watermark
    ///
    /// Returns true if the row was updated.
    pub async fn update_statistics(
        &self,
        plane_id: String,
        update: StatisticsUpdate,
    ) -> Result<bool> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut conn = pool.get()?;
            let stats = update.statistics;
            let updated = diesel::update(
                planes::table
                    .filter(planes::id.eq(&plane_id))
                    .filter(
                        planes::statistics_as_of.is_not_distinct_from(update.expected_as_of),
                    ),
            )
            .set((
                planes::total_distance_miles.eq(stats.total_distance_miles),
                planes::distance_since_maintenance_miles
                    .eq(stats.distance_since_maintenance_miles),
                planes::maintenance_required.eq(stats.maintenance_required),
                planes::airtime_minutes.eq(stats.airtime_minutes),
                planes::departed_from.eq(Some(&update.departed_from)),
                planes::statistics_as_of.eq(Some(update.statistics_as_of)),
                planes::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;

            debug!(
                "Statistics update for plane {} affected {} row(s)",
                plane_id, updated
            );
            Ok(updated == 1)
        })
        .await?
    }

    pub async fn insert(&self, plane: &Plane) -> Result<()> {
        let pool = self.pool.clone();
        let record = NewPlaneRecord::from(plane);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            diesel::insert_into(planes::table)
                .values(&record)
                .execute(&mut conn)?;
            Ok(())
        })
        .await?
    }
}
