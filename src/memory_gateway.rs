//! In-process fleet store
//!
//! Backs the aggregator in tests and local runs without PostgreSQL. Supports
//! injected latency and transient failures so concurrency and retry paths can
//! be exercised deterministically.

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::cities::City;
use crate::gateway::{FleetGateway, GatewayError, GatewayResult};
use crate::planes::{Plane, PlaneSnapshot, StatisticsUpdate};

#[derive(Default)]
struct FaultPlan {
    failing_reads: AtomicU32,
    failing_updates: AtomicU32,
}

impl FaultPlan {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryGateway {
    cities: Arc<DashMap<String, City>>,
    planes: Arc<DashMap<String, Plane>>,
    latency: Option<Duration>,
    faults: Arc<FaultPlan>,
    writes: Arc<AtomicU64>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every store call sleeps for `latency` before touching the data
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert_city(&self, city: City) {
        self.cities.insert(city.id.clone(), city);
    }

    pub fn insert_plane(&self, mut plane: Plane) {
        plane.seed_statistics_as_of();
        self.planes.insert(plane.id.clone(), plane);
    }

    pub fn plane(&self, plane_id: &str) -> Option<Plane> {
        self.planes.get(plane_id).map(|p| p.value().clone())
    }

    /// Simulate the external landing request: set `landedAt`/`landedOn`
    pub fn land_plane(
        &self,
        plane_id: &str,
        city_id: &str,
        landed_on: chrono::DateTime<chrono::Utc>,
    ) -> Option<Plane> {
        let mut plane = self.planes.get_mut(plane_id)?;
        plane.seed_statistics_as_of();
        plane.landed_at = Some(city_id.to_string());
        plane.landed_on = Some(landed_on);
        if let Some(city) = self.cities.get(city_id) {
            plane.current_location = city.position;
        }
        if plane.route.first().map(String::as_str) == Some(city_id) {
            plane.route.remove(0);
        }
        Some(plane.clone())
    }

    /// The next `n` read calls fail with [`GatewayError::Unavailable`]
    pub fn fail_next_reads(&self, n: u32) {
        self.faults.failing_reads.store(n, Ordering::SeqCst);
    }

    /// The next `n` update calls fail with [`GatewayError::Unavailable`]
    pub fn fail_next_updates(&self, n: u32) {
        self.faults.failing_updates.store(n, Ordering::SeqCst);
    }

    /// Number of successful statistics writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_read_fault(&self) -> GatewayResult<()> {
        if FaultPlan::take(&self.faults.failing_reads) {
            return Err(GatewayError::Unavailable(anyhow!("injected read failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl FleetGateway for InMemoryGateway {
    async fn get_cities_by_ids(&self, ids: &[String]) -> GatewayResult<HashMap<String, City>> {
        self.simulate_latency().await;
        self.check_read_fault()?;
        Ok(ids
            .iter()
            .filter_map(|id| self.cities.get(id).map(|c| (id.clone(), c.value().clone())))
            .collect())
    }

    async fn get_plane_statistics(&self, plane_id: &str) -> GatewayResult<Option<PlaneSnapshot>> {
        self.simulate_latency().await;
        self.check_read_fault()?;
        Ok(self.planes.get(plane_id).map(|p| p.snapshot()))
    }

    async fn update_plane_statistics(
        &self,
        plane_id: &str,
        update: &StatisticsUpdate,
    ) -> GatewayResult<bool> {
        self.simulate_latency().await;
        if FaultPlan::take(&self.faults.failing_updates) {
            return Err(GatewayError::Unavailable(anyhow!("injected update failure")));
        }

        let Some(mut plane) = self.planes.get_mut(plane_id) else {
            return Ok(false);
        };
        if plane.statistics_as_of != update.expected_as_of {
            return Ok(false);
        }
        plane.statistics = update.statistics;
        plane.departed_from = Some(update.departed_from.clone());
        plane.statistics_as_of = Some(update.statistics_as_of);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn get_plane(&self, plane_id: &str) -> GatewayResult<Option<Plane>> {
        self.simulate_latency().await;
        self.check_read_fault()?;
        Ok(self.plane(plane_id))
    }
}
