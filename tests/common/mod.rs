//! Shared fixtures for integration tests
//!
//! In-memory fleets for the pipeline tests, plus `TestDatabase` for the tests
//! that need a real PostgreSQL.
//!
//! # Usage
//!
//! ```no_run
//! use common::TestDatabase;
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let test_db = TestDatabase::new()
//!         .await
//!         .expect("Failed to create test database");
//!     let pool = test_db.pool();
//!     // Database is dropped when test_db goes out of scope
//! }
//! ```
#![allow(dead_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use contrail::change_feed::{ChangeNotification, LANDED_AT_FIELD, OperationType};
use contrail::cities::City;
use contrail::geo::GeoPoint;
use contrail::memory_gateway::InMemoryGateway;
use contrail::planes::Plane;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/");

type PgPool = Pool<ConnectionManager<PgConnection>>;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

pub fn minutes_after_t0(minutes: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::minutes(minutes)
}

/// (id, country, latitude, longitude)
pub const CITIES: &[(&str, &str, f64, f64)] = &[
    ("london", "United Kingdom", 51.5072, -0.1276),
    ("paris", "France", 48.8566, 2.3522),
    ("berlin", "Germany", 52.5200, 13.4050),
    ("madrid", "Spain", 40.4168, -3.7038),
    ("rome", "Italy", 41.9028, 12.4964),
    ("new-york", "United States", 40.7128, -74.0060),
];

pub fn cities() -> Vec<City> {
    CITIES
        .iter()
        .map(|(id, country, lat, lon)| City::new(*id, *country, GeoPoint::new(*lat, *lon)))
        .collect()
}

pub fn city(id: &str) -> City {
    cities()
        .into_iter()
        .find(|c| c.id == id)
        .unwrap_or_else(|| panic!("unknown fixture city {id}"))
}

/// In-memory fleet with every fixture city and `planes` parked in London at t0
pub fn fleet(planes: &[&str]) -> Arc<InMemoryGateway> {
    populate(InMemoryGateway::new(), planes)
}

/// Like [`fleet`], but every store call takes `latency`
pub fn slow_fleet(planes: &[&str], latency: Duration) -> Arc<InMemoryGateway> {
    populate(InMemoryGateway::new().with_latency(latency), planes)
}

fn populate(gateway: InMemoryGateway, planes: &[&str]) -> Arc<InMemoryGateway> {
    let gateway = Arc::new(gateway);
    for city in cities() {
        gateway.insert_city(city);
    }
    let london = city("london");
    for plane in planes {
        gateway.insert_plane(Plane::registered_at(
            *plane,
            "london",
            london.position,
            t0(),
        ));
    }
    gateway
}

/// Change notification for a `landedAt` update carrying `plane` as post-image
pub fn landing_notification(plane: &Plane) -> ChangeNotification {
    ChangeNotification {
        operation_type: OperationType::Update,
        document_key: plane.id.clone(),
        updated_fields: vec![
            LANDED_AT_FIELD.to_string(),
            "landedOn".to_string(),
            "currentLocation".to_string(),
        ],
        full_document: Some(plane.clone()),
    }
}

static DATABASE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated PostgreSQL database for one test
///
/// Created from `TEST_DATABASE_URL` (default
/// `postgresql://localhost/contrail_test`) with a unique name, migrated, and
/// dropped with `WITH (FORCE)` when this value goes out of scope. Requires
/// PostgreSQL 13+.
pub struct TestDatabase {
    db_name: String,
    pool: PgPool,
    admin_url: String,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        dotenvy::dotenv().ok();
        let base_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/contrail_test".to_string());
        let (admin_url, db_name) = Self::generate_database_info(&base_url);
        let test_db_url = base_url.replace("/contrail_test", &format!("/{}", db_name));

        let admin = admin_url.clone();
        let name = db_name.clone();
        let url = test_db_url.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = PgConnection::establish(&admin).context(
                "Failed to connect to PostgreSQL for database creation. Is PostgreSQL running?",
            )?;
            // db_name is generated from digits only
            diesel::sql_query(format!("CREATE DATABASE \"{}\"", name))
                .execute(&mut conn)
                .with_context(|| format!("Failed to create database '{}'", name))?;

            let mut conn = PgConnection::establish(&url)?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
            Ok(())
        })
        .await
        .context("Database creation task panicked")??;

        let manager = ConnectionManager::<PgConnection>::new(&test_db_url);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .with_context(|| format!("Failed to create connection pool for {}", db_name))?;

        Ok(TestDatabase {
            db_name,
            pool,
            admin_url,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn name(&self) -> &str {
        &self.db_name
    }

    fn generate_database_info(base_url: &str) -> (String, String) {
        let db_name = format!(
            "contrail_test_{}_{}",
            std::process::id(),
            DATABASE_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let admin_url = base_url.replace("/contrail_test", "/postgres");
        (admin_url, db_name)
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let dropped = PgConnection::establish(&self.admin_url).ok().and_then(|mut conn| {
            diesel::sql_query(format!(
                "DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)",
                self.db_name
            ))
            .execute(&mut conn)
            .ok()
        });
        if dropped.is_none() {
            eprintln!(
                "Warning: Failed to drop test database '{}'. \
                 You may need to manually clean up: DROP DATABASE {};",
                self.db_name, self.db_name
            );
        }
    }
}
