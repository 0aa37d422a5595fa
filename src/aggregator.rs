use chrono::SubsecRound;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::gateway::{FleetGateway, GatewayError, GatewayResult};
use crate::geo::great_circle_distance_miles;
use crate::planes::{LandingEvent, StatisticsUpdate};
use crate::statistics::{PlaneStatistics, elapsed_minutes_between};

/// How hard the aggregator tries before giving up on one landing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per store call, including the first one
    pub store_attempts: u32,
    /// Delay before the first retry; doubled after every failure
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Re-reads allowed when the conditional update loses a race
    pub conflict_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            store_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            conflict_retries: 3,
        }
    }
}

/// Why a landing produced no statistics change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No departure city recorded for the plane
    MissingEndpoint,
    /// Departure and landing city are the same
    SameCity,
    /// Fewer than two endpoint cities exist in the store
    ReferenceDataIncomplete,
    PlaneNotFound,
    /// Landing already counted (duplicate or stale delivery)
    Replay,
}

impl SkipReason {
    pub const ALL: [SkipReason; 5] = [
        SkipReason::MissingEndpoint,
        SkipReason::SameCity,
        SkipReason::ReferenceDataIncomplete,
        SkipReason::PlaneNotFound,
        SkipReason::Replay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingEndpoint => "missing_endpoint",
            SkipReason::SameCity => "same_city",
            SkipReason::ReferenceDataIncomplete => "reference_data_incomplete",
            SkipReason::PlaneNotFound => "plane_not_found",
            SkipReason::Replay => "replay",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LegOutcome {
    Applied {
        statistics: PlaneStatistics,
        leg_distance_miles: f64,
    },
    Skipped(SkipReason),
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("store failure for plane {plane_id} after {attempts} attempt(s): {source}")]
    Store {
        plane_id: String,
        attempts: u32,
        #[source]
        source: GatewayError,
    },
    #[error("plane {plane_id} was modified concurrently {attempts} times, giving up")]
    ConflictRetriesExhausted { plane_id: String, attempts: u32 },
}

/// Computes one leg per landing and folds it into the plane's statistics
///
/// Callers must not run two landings for the same plane concurrently; the
/// worker pool guarantees this. The conditional write still protects against
/// other processes writing the same plane.
#[derive(Clone)]
pub struct LegAggregator {
    gateway: Arc<dyn FleetGateway>,
    policy: RetryPolicy,
}

impl LegAggregator {
    pub fn new(gateway: Arc<dyn FleetGateway>, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[tracing::instrument(skip(self, event), fields(plane_id = %event.plane_id, sequence = event.sequence))]
    pub async fn process_landing(&self, event: &LandingEvent) -> Result<LegOutcome, AggregatorError> {
        let plane_id = event.plane_id.as_str();
        // watermarks are stored with microsecond precision
        let landed_on = event.landed_on.trunc_subsecs(6);

        let Some(departed_from) = event.departed_from.as_deref() else {
            debug!("No departure city recorded, skipping landing at {}", event.landed_at);
            return Ok(LegOutcome::Skipped(SkipReason::MissingEndpoint));
        };
        if departed_from == event.landed_at {
            debug!("Departure and landing city are both {}, skipping", departed_from);
            return Ok(LegOutcome::Skipped(SkipReason::SameCity));
        }

        let gateway = &self.gateway;
        let ids = [departed_from.to_string(), event.landed_at.clone()];
        let ids_ref = &ids;
        let cities = self
            .with_retry(plane_id, "get_cities_by_ids", move || {
                gateway.get_cities_by_ids(ids_ref)
            })
            .await?;

        let (Some(from), Some(to)) = (cities.get(departed_from), cities.get(&event.landed_at))
        else {
            warn!(
                "Resolved {} of 2 cities for leg {} -> {}, skipping",
                cities.len(),
                departed_from,
                event.landed_at
            );
            return Ok(LegOutcome::Skipped(SkipReason::ReferenceDataIncomplete));
        };
        let leg_distance_miles = great_circle_distance_miles(&from.position, &to.position);

        for attempt in 1..=self.policy.conflict_retries + 1 {
            let snapshot = self
                .with_retry(plane_id, "get_plane_statistics", move || {
                    gateway.get_plane_statistics(plane_id)
                })
                .await?;
            let Some(snapshot) = snapshot else {
                warn!("Plane not found, skipping landing at {}", event.landed_at);
                return Ok(LegOutcome::Skipped(SkipReason::PlaneNotFound));
            };

            if let Some(previous) = snapshot.previous_landed_on {
                if previous >= landed_on {
                    debug!(
                        "Landing at {} ({}) already counted (statistics as of {}), skipping",
                        event.landed_at, landed_on, previous
                    );
                    return Ok(LegOutcome::Skipped(SkipReason::Replay));
                }
            }

            let elapsed = elapsed_minutes_between(snapshot.previous_landed_on, landed_on);
            let statistics = snapshot.statistics.apply_leg(leg_distance_miles, elapsed);
            let update = StatisticsUpdate {
                statistics,
                departed_from: event.landed_at.clone(),
                statistics_as_of: landed_on,
                expected_as_of: snapshot.previous_landed_on,
            };
            let update_ref = &update;
            let applied = self
                .with_retry(plane_id, "update_plane_statistics", move || {
                    gateway.update_plane_statistics(plane_id, update_ref)
                })
                .await?;

            if applied {
                if statistics.maintenance_required && !snapshot.statistics.maintenance_required {
                    info!(
                        "Plane requires maintenance: {:.1} miles since last maintenance",
                        statistics.distance_since_maintenance_miles
                    );
                }
                trace!(
                    "Applied leg {} -> {}: {:.1} miles, {:.1} minutes",
                    departed_from, event.landed_at, leg_distance_miles, elapsed
                );
                return Ok(LegOutcome::Applied {
                    statistics,
                    leg_distance_miles,
                });
            }

            warn!(
                "Statistics changed underneath us (attempt {}/{}), re-reading",
                attempt,
                self.policy.conflict_retries + 1
            );
            metrics::counter!("aggregator.update.conflict_total").increment(1);
        }

        Err(AggregatorError::ConflictRetriesExhausted {
            plane_id: plane_id.to_string(),
            attempts: self.policy.conflict_retries + 1,
        })
    }

    /// Run a store call, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(
        &self,
        plane_id: &str,
        operation: &str,
        mut call: F,
    ) -> Result<T, AggregatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 1;
        let mut delay = self.policy.base_delay;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.store_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation, attempt, self.policy.store_attempts, e, delay
                    );
                    metrics::counter!("aggregator.store.retry_total").increment(1);
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.policy.max_delay);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(AggregatorError::Store {
                        plane_id: plane_id.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}
