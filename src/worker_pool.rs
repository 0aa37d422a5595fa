//! Per-plane serialized, cross-plane parallel landing processing
//!
//! Every plane with pending landings owns one worker task fed by an unbounded
//! flume queue. Jobs are enqueued while the plane's map entry is locked, so
//! the order in which `dispatch` calls for one plane return is the order its
//! worker processes them. A global semaphore bounds the number of jobs that
//! are queued or running across all planes.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::aggregator::{AggregatorError, LegAggregator, LegOutcome};
use crate::change_feed::{DeliveryAck, ack_delivery, nak_delivery};
use crate::planes::LandingEvent;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    /// Landings queued or running across all planes before `dispatch` waits
    pub max_in_flight: usize,
    /// A plane's worker exits after this long without work
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("aggregator pool is shut down")]
    PoolClosed,
    #[error("worker for plane {0} stopped before finishing its landing")]
    WorkerLost(String),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

struct PlaneJob {
    event: LandingEvent,
    ack: Option<Arc<dyn DeliveryAck>>,
    reply: oneshot::Sender<Result<LegOutcome, DispatchError>>,
    enqueued_at: Instant,
    _permit: OwnedSemaphorePermit,
}

struct PlaneQueue {
    tx: flume::Sender<PlaneJob>,
    generation: u64,
}

struct PoolInner {
    aggregator: LegAggregator,
    config: PoolConfig,
    queues: DashMap<String, PlaneQueue>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    closed: CancellationToken,
    next_generation: AtomicU64,
    next_arrival: AtomicU64,
    live_workers: Arc<AtomicUsize>,
}

/// Counts a running worker until its task ends, including by panic
struct LiveWorker {
    count: Arc<AtomicUsize>,
}

impl LiveWorker {
    fn register(count: &Arc<AtomicUsize>) -> Self {
        let live = count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("aggregator.pool.active_planes").set(live as f64);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        let live = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("aggregator.pool.active_planes").set(live as f64);
    }
}

/// Handle to one dispatched landing
#[derive(Debug)]
pub struct LegTicket {
    plane_id: String,
    arrival: u64,
    reply: oneshot::Receiver<Result<LegOutcome, DispatchError>>,
}

impl LegTicket {
    /// Pool-wide arrival number; for one plane, lower numbers run first
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn plane_id(&self) -> &str {
        &self.plane_id
    }

    /// Wait for the landing to be processed
    pub async fn outcome(self) -> Result<LegOutcome, DispatchError> {
        let LegTicket {
            plane_id, reply, ..
        } = self;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::WorkerLost(plane_id)),
        }
    }
}

#[derive(Clone)]
pub struct AggregatorPool {
    inner: Arc<PoolInner>,
}

impl AggregatorPool {
    pub fn new(aggregator: LegAggregator, config: PoolConfig) -> Self {
        info!(
            "Starting aggregator pool (max {} landings in flight, idle timeout {:?})",
            config.max_in_flight, config.idle_timeout
        );
        Self {
            inner: Arc::new(PoolInner {
                aggregator,
                config,
                queues: DashMap::new(),
                permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
                tracker: TaskTracker::new(),
                closed: CancellationToken::new(),
                next_generation: AtomicU64::new(0),
                next_arrival: AtomicU64::new(0),
                live_workers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Queue a landing behind every earlier landing of the same plane
    ///
    /// Waits while the pool is at capacity. When `ack` is given, the delivery
    /// is acknowledged after the landing is processed (or skipped) and
    /// negatively acknowledged if processing fails.
    pub async fn dispatch(
        &self,
        event: LandingEvent,
        ack: Option<Arc<dyn DeliveryAck>>,
    ) -> Result<LegTicket, DispatchError> {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return Err(DispatchError::PoolClosed);
        }

        let permit = tokio::select! {
            permit = inner.permits.clone().acquire_owned() => {
                permit.map_err(|_| DispatchError::PoolClosed)?
            }
            _ = inner.closed.cancelled() => return Err(DispatchError::PoolClosed),
        };

        let plane_id = event.plane_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let entry = inner.queues.entry(plane_id.clone());
        // checked under the entry lock so shutdown cannot miss a new worker
        if inner.closed.is_cancelled() {
            return Err(DispatchError::PoolClosed);
        }
        let mut queue = entry.or_insert_with(|| spawn_worker(inner, &plane_id));

        let arrival = inner.next_arrival.fetch_add(1, Ordering::SeqCst);
        let job = PlaneJob {
            event,
            ack,
            reply: reply_tx,
            enqueued_at: Instant::now(),
            _permit: permit,
        };

        if let Err(flume::SendError(job)) = queue.tx.send(job) {
            warn!("Worker for plane {} is gone, starting a new one", plane_id);
            *queue = spawn_worker(inner, &plane_id);
            if queue.tx.send(job).is_err() {
                return Err(DispatchError::WorkerLost(plane_id));
            }
        }
        drop(queue);

        trace!("Queued landing #{} for plane {}", arrival, plane_id);
        Ok(LegTicket {
            plane_id,
            arrival,
            reply: reply_rx,
        })
    }

    /// Number of planes that currently have a worker
    pub fn active_planes(&self) -> usize {
        self.inner.queues.len()
    }

    /// Number of worker tasks still running
    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::SeqCst)
    }

    /// Stop accepting landings and wait for every queued one to finish
    pub async fn shutdown(&self) {
        info!(
            "Shutting down aggregator pool, draining {} plane queue(s)",
            self.active_planes()
        );
        self.inner.closed.cancel();
        // dropping the senders lets each worker drain its queue and exit
        self.inner.queues.clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Aggregator pool drained");
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, plane_id: &str) -> PlaneQueue {
    let (tx, rx) = flume::unbounded();
    let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
    let worker_inner = Arc::clone(inner);
    let worker_plane = plane_id.to_string();
    let live = LiveWorker::register(&inner.live_workers);
    inner
        .tracker
        .spawn(run_worker(worker_inner, worker_plane, generation, rx, live));
    debug!("Started worker for plane {}", plane_id);
    PlaneQueue { tx, generation }
}

async fn run_worker(
    inner: Arc<PoolInner>,
    plane_id: String,
    generation: u64,
    rx: flume::Receiver<PlaneJob>,
    _live: LiveWorker,
) {
    let mut processed = 0u64;
    loop {
        let job = tokio::select! {
            job = rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
            _ = tokio::time::sleep(inner.config.idle_timeout) => {
                // sends happen under the same entry lock, so an empty queue
                // here stays empty
                let retired = inner
                    .queues
                    .remove_if(&plane_id, |_, queue| {
                        queue.generation == generation && rx.is_empty()
                    })
                    .is_some();
                if retired {
                    break;
                }
                continue;
            }
        };
        process_job(&inner.aggregator, job).await;
        processed += 1;
    }
    debug!(
        "Worker for plane {} stopped after {} landing(s)",
        plane_id, processed
    );
}

async fn process_job(aggregator: &LegAggregator, job: PlaneJob) {
    let PlaneJob {
        event,
        ack,
        reply,
        enqueued_at,
        _permit,
    } = job;

    metrics::histogram!("aggregator.pool.queue_wait_ms")
        .record(enqueued_at.elapsed().as_millis() as f64);
    let start = Instant::now();
    let result = aggregator.process_landing(&event).await;
    metrics::histogram!("aggregator.leg.process_duration_ms")
        .record(start.elapsed().as_millis() as f64);

    match &result {
        Ok(LegOutcome::Applied { .. }) => {
            metrics::counter!("aggregator.leg.applied_total").increment(1);
        }
        Ok(LegOutcome::Skipped(reason)) => {
            metrics::counter!("aggregator.leg.skipped_total", "reason" => reason.as_str())
                .increment(1);
        }
        Err(e) => {
            error!(
                "Failed to process landing of plane {} at {}: {}",
                event.plane_id, event.landed_at, e
            );
            metrics::counter!("aggregator.leg.failed_total").increment(1);
        }
    }

    if let Some(ack) = ack {
        if result.is_ok() {
            ack_delivery(ack.as_ref(), event.sequence).await;
        } else {
            nak_delivery(ack.as_ref(), event.sequence).await;
        }
    }

    // the caller may have dropped its ticket
    let _ = reply.send(result.map_err(DispatchError::from));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{RetryPolicy, SkipReason};
    use crate::cities::City;
    use crate::gateway::{FleetGateway, GatewayResult};
    use crate::geo::GeoPoint;
    use crate::memory_feed::{RecordingAck, Settlement};
    use crate::memory_gateway::InMemoryGateway;
    use crate::planes::{Plane, PlaneSnapshot, StatisticsUpdate};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::HashMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn pool_with(gateway: &Arc<InMemoryGateway>, config: PoolConfig) -> AggregatorPool {
        let policy = RetryPolicy {
            store_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            conflict_retries: 1,
        };
        AggregatorPool::new(LegAggregator::new(gateway.clone(), policy), config)
    }

    fn gateway() -> Arc<InMemoryGateway> {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_city(City::new("a", "XX", GeoPoint::new(10.0, 10.0)));
        gateway.insert_city(City::new("b", "XX", GeoPoint::new(11.0, 10.0)));
        gateway.insert_plane(Plane::registered_at("p1", "a", GeoPoint::new(10.0, 10.0), t0()));
        gateway
    }

    fn landing(minutes: i64) -> LandingEvent {
        LandingEvent {
            plane_id: "p1".to_string(),
            departed_from: Some("a".to_string()),
            landed_at: "b".to_string(),
            landed_on: t0() + ChronoDuration::minutes(minutes),
            sequence: minutes as u64,
        }
    }

    #[tokio::test]
    async fn test_successful_landing_is_acked() {
        let gateway = gateway();
        let pool = pool_with(&gateway, PoolConfig::default());
        let ack = Arc::new(RecordingAck::new());

        let ticket = pool.dispatch(landing(45), Some(ack.clone())).await.unwrap();
        assert_eq!(ticket.plane_id(), "p1");
        let outcome = ticket.outcome().await.unwrap();
        assert!(matches!(outcome, LegOutcome::Applied { .. }));
        assert_eq!(ack.settlement(), Some(Settlement::Acked));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_skipped_landing_is_acked() {
        let gateway = gateway();
        let pool = pool_with(&gateway, PoolConfig::default());
        let ack = Arc::new(RecordingAck::new());

        let mut event = landing(45);
        event.landed_at = "a".to_string();
        let outcome = pool
            .dispatch(event, Some(ack.clone()))
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert_eq!(outcome, LegOutcome::Skipped(SkipReason::SameCity));
        assert_eq!(ack.settlement(), Some(Settlement::Acked));
    }

    #[tokio::test]
    async fn test_failed_landing_is_naked() {
        let gateway = gateway();
        gateway.fail_next_reads(10);
        let pool = pool_with(&gateway, PoolConfig::default());
        let ack = Arc::new(RecordingAck::new());

        let result = pool
            .dispatch(landing(45), Some(ack.clone()))
            .await
            .unwrap()
            .outcome()
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::Aggregator(AggregatorError::Store { .. }))
        ));
        assert_eq!(ack.settlement(), Some(Settlement::Naked));
        assert_eq!(gateway.write_count(), 0);
    }

    #[tokio::test]
    async fn test_arrivals_increase_per_dispatch() {
        let gateway = gateway();
        let pool = pool_with(&gateway, PoolConfig::default());
        let first = pool.dispatch(landing(10), None).await.unwrap();
        let second = pool.dispatch(landing(20), None).await.unwrap();
        assert!(first.arrival() < second.arrival());
        first.outcome().await.unwrap();
        second.outcome().await.unwrap();
        assert_eq!(
            gateway.plane("p1").unwrap().statistics_as_of,
            Some(t0() + ChronoDuration::minutes(20))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_retires() {
        let gateway = gateway();
        let pool = pool_with(
            &gateway,
            PoolConfig {
                max_in_flight: 4,
                idle_timeout: Duration::from_secs(1),
            },
        );
        pool.dispatch(landing(30), None)
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert_eq!(pool.active_planes(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.active_planes(), 0);

        // a new landing starts a fresh worker
        let outcome = pool
            .dispatch(landing(90), None)
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert!(matches!(outcome, LegOutcome::Applied { .. }));
    }

    /// Panics on its first city lookup, then behaves like `inner`
    struct PanicOnceGateway {
        inner: Arc<InMemoryGateway>,
        panicked: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl FleetGateway for PanicOnceGateway {
        async fn get_cities_by_ids(
            &self,
            ids: &[String],
        ) -> GatewayResult<HashMap<String, City>> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("city lookup blew up");
            }
            self.inner.get_cities_by_ids(ids).await
        }

        async fn get_plane_statistics(&self, plane_id: &str) -> GatewayResult<Option<PlaneSnapshot>> {
            self.inner.get_plane_statistics(plane_id).await
        }

        async fn update_plane_statistics(
            &self,
            plane_id: &str,
            update: &StatisticsUpdate,
        ) -> GatewayResult<bool> {
            self.inner.update_plane_statistics(plane_id, update).await
        }

        async fn get_plane(&self, plane_id: &str) -> GatewayResult<Option<Plane>> {
            self.inner.get_plane(plane_id).await
        }
    }

    #[tokio::test]
    async fn test_panicked_worker_is_replaced_and_not_counted_twice() {
        let memory = gateway();
        let flaky = Arc::new(PanicOnceGateway {
            inner: memory.clone(),
            panicked: std::sync::atomic::AtomicBool::new(false),
        });
        let policy = RetryPolicy {
            store_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            conflict_retries: 0,
        };
        let pool = AggregatorPool::new(LegAggregator::new(flaky, policy), PoolConfig::default());

        let lost = pool.dispatch(landing(30), None).await.unwrap().outcome().await;
        assert!(matches!(lost, Err(DispatchError::WorkerLost(_))));
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.live_workers() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("panicked worker was still counted");

        let outcome = pool
            .dispatch(landing(60), None)
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert!(matches!(outcome, LegOutcome::Applied { .. }));
        assert_eq!(pool.live_workers(), 1);
        assert_eq!(memory.write_count(), 1);

        pool.shutdown().await;
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_rejected() {
        let gateway = gateway();
        let pool = pool_with(&gateway, PoolConfig::default());
        pool.shutdown().await;
        let result = pool.dispatch(landing(30), None).await;
        assert!(matches!(result, Err(DispatchError::PoolClosed)));
    }
}
