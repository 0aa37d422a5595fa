use anyhow::Result;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use tracing::trace;

use crate::cities::City;
use crate::geo::GeoPoint;
use crate::schema::cities;

type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = cities)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CityRecord {
    pub id: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<CityRecord> for City {
    fn from(record: CityRecord) -> Self {
        City {
            id: record.id,
            country: record.country,
            position: GeoPoint::new(record.latitude, record.longitude),
        }
    }
}

impl From<&City> for CityRecord {
    fn from(city: &City) -> Self {
        CityRecord {
            id: city.id.clone(),
            country: city.country.clone(),
            latitude: city.position.latitude,
            longitude: city.position.longitude,
        }
    }
}

#[derive(Clone)]
pub struct CitiesRepository {
    pool: PgPool,
}

impl CitiesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch all cities whose id is in `ids`. Unknown ids are skipped.
    pub async fn get_by_ids(&self, ids: Vec<String>) -> Result<Vec<City>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<City>> {
            let mut conn = pool.get()?;
            let records = cities::table
                .filter(cities::id.eq_any(&ids))
                .select(CityRecord::as_select())
                .load::<CityRecord>(&mut conn)?;
            trace!("Resolved {} of {} cities", records.len(), ids.len());
            Ok(records.into_iter().map(City::from).collect())
        })
        .await?
    }

    /// Insert or replace reference cities
    pub async fn upsert(&self, cities_list: Vec<City>) -> Result<usize> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = pool.get()?;
            let records: Vec<CityRecord> = cities_list.iter().map(CityRecord::from).collect();
            let mut upserted = 0;
            for record in &records {
                upserted += diesel::insert_into(cities::table)
                    .values(record)
                    .on_conflict(cities::id)
                    .do_update()
                    .set((
                        cities::country.eq(&record.country),
                        cities::latitude.eq(record.latitude),
                        cities::longitude.eq(record.longitude),
                    ))
                    .execute(&mut conn)?;
            }
            Ok(upserted)
        })
        .await?
    }
}
