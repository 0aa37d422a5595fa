use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::change_feed::{
    ChangeFeed, ChangeFilter, ChangeNotification, DeliveryStream, FeedDelivery, ack_delivery,
    nak_delivery,
};
use crate::gateway::{FleetGateway, GatewayError};
use crate::planes::Plane;
use crate::worker_pool::{AggregatorPool, DispatchError};

/// Resubscription behaviour after the feed fails
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedRetryPolicy {
    /// Delay before the first resubscription; zero retries immediately
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures without a single delivery before giving up
    pub max_consecutive_failures: u32,
}

impl Default for FeedRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_consecutive_failures: 10,
        }
    }
}

struct Backoff {
    policy: FeedRetryPolicy,
    failures: u32,
    delay: Duration,
}

impl Backoff {
    fn new(policy: FeedRetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            delay: policy.initial_delay,
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.delay = self.policy.initial_delay;
    }

    /// Delay before the next attempt, or `None` once failures are exhausted
    fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_consecutive_failures {
            return None;
        }
        let delay = self.delay;
        self.delay = std::cmp::min(
            if self.delay.is_zero() {
                Duration::from_secs(1)
            } else {
                self.delay * 2
            },
            self.policy.max_delay,
        );
        Some(delay)
    }
}

/// What the consumer did with the deliveries it read
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub dispatched: u64,
    /// Plane took off (`landedAt` cleared)
    pub departures: u64,
    /// Key-only notification whose looked-up plane was airborne: a departure,
    /// or a landing overtaken by the next takeoff
    pub airborne_at_lookup: u64,
    /// Notification did not match the landing filter
    pub ignored: u64,
    pub malformed: u64,
    pub subscriptions: u64,
    pub feed_errors: u64,
}

enum SessionEnd {
    Shutdown,
    Lost(anyhow::Error),
}

enum Disposition {
    Dispatched,
    Departure,
    AirborneAtLookup,
    Ignored,
    Malformed,
    /// Left unsettled or naked, the feed redelivers it
    Deferred,
}

/// Reads landing notifications and hands them to the aggregator pool
pub struct LandingConsumer {
    feed: Arc<dyn ChangeFeed>,
    gateway: Arc<dyn FleetGateway>,
    pool: AggregatorPool,
    filter: ChangeFilter,
    retry: FeedRetryPolicy,
}

impl LandingConsumer {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        gateway: Arc<dyn FleetGateway>,
        pool: AggregatorPool,
        retry: FeedRetryPolicy,
    ) -> Self {
        Self {
            feed,
            gateway,
            pool,
            filter: ChangeFilter::landings(),
            retry,
        }
    }

    /// Consume until `shutdown` fires or the feed fails too often in a row
    ///
    /// On return the pool has been drained: every dispatched landing has been
    /// processed and settled with the feed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        let mut backoff = Backoff::new(self.retry);
        // kept open until the pool is drained
        let mut held: Option<DeliveryStream> = None;

        let outcome = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            let subscribed = tokio::select! {
                subscribed = self.feed.subscribe(&self.filter) => subscribed,
                _ = shutdown.cancelled() => break Ok(()),
            };

            let error = match subscribed {
                Ok(mut stream) => {
                    stats.subscriptions += 1;
                    info!("Subscribed to landing notifications");
                    match self
                        .consume(&mut stream, &shutdown, &mut backoff, &mut stats)
                        .await
                    {
                        SessionEnd::Shutdown => {
                            held = Some(stream);
                            break Ok(());
                        }
                        SessionEnd::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            stats.feed_errors += 1;
            metrics::counter!("landing.feed.error_total").increment(1);
            let Some(delay) = backoff.next_delay() else {
                error!(
                    "Change feed failed {} times in a row, giving up: {:#}",
                    self.retry.max_consecutive_failures, error
                );
                break Err(error.context("change feed unavailable"));
            };
            warn!(
                "Change feed lost: {:#}, resubscribing in {:?} (failure {}/{})",
                error, delay, backoff.failures, self.retry.max_consecutive_failures
            );
            metrics::counter!("landing.feed.resubscribe_total").increment(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break Ok(()),
            }
        };

        info!("Landing consumer stopping, draining aggregator pool...");
        self.pool.shutdown().await;
        drop(held);
        info!(
            "Landing consumer stopped: {} received, {} dispatched, {} departures, {} ignored, {} malformed",
            stats.received, stats.dispatched, stats.departures, stats.ignored, stats.malformed
        );
        outcome.map(|_| stats)
    }

    async fn consume(
        &self,
        stream: &mut DeliveryStream,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
        stats: &mut ConsumerStats,
    ) -> SessionEnd {
        let start_time = Instant::now();
        let mut session_received = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                next = stream.next() => next,
            };
            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return SessionEnd::Lost(e),
                None => return SessionEnd::Lost(anyhow!("change feed stream ended")),
            };

            backoff.reset();
            stats.received += 1;
            session_received += 1;
            metrics::counter!("landing.feed.received_total").increment(1);

            let disposition = tokio::select! {
                disposition = self.handle_delivery(delivery) => disposition,
                // the delivery stays unacknowledged and is redelivered later
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
            };
            match disposition {
                Disposition::Dispatched => stats.dispatched += 1,
                Disposition::Departure => stats.departures += 1,
                Disposition::AirborneAtLookup => stats.airborne_at_lookup += 1,
                Disposition::Ignored => stats.ignored += 1,
                Disposition::Malformed => stats.malformed += 1,
                Disposition::Deferred => {}
            }

            if session_received.is_multiple_of(1000) {
                let rate = session_received as f64 / start_time.elapsed().as_secs_f64();
                info!(
                    "Received {} notifications this session ({:.1}/s), {} planes active",
                    session_received,
                    rate,
                    self.pool.active_planes()
                );
            }
        }
    }

    async fn handle_delivery(&self, delivery: FeedDelivery) -> Disposition {
        let sequence = delivery.sequence;
        let notification = match ChangeNotification::decode(&delivery.payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Malformed change notification #{}: {}", sequence, e);
                metrics::counter!("landing.feed.malformed_total").increment(1);
                ack_delivery(delivery.ack.as_ref(), sequence).await;
                return Disposition::Malformed;
            }
        };

        if !self.filter.matches(&notification) {
            debug!(
                "Ignoring {} of plane {} (fields {:?})",
                notification.operation_type, notification.document_key, notification.updated_fields
            );
            metrics::counter!("landing.feed.ignored_total").increment(1);
            ack_delivery(delivery.ack.as_ref(), sequence).await;
            return Disposition::Ignored;
        }

        let looked_up = notification.full_document.is_none();
        let plane = match self.resolve_document(notification).await {
            Ok(Some(plane)) => plane,
            Ok(None) => {
                metrics::counter!("landing.feed.ignored_total").increment(1);
                ack_delivery(delivery.ack.as_ref(), sequence).await;
                return Disposition::Ignored;
            }
            Err(e) if e.is_transient() => {
                warn!("Plane lookup for notification #{} failed: {}", sequence, e);
                metrics::counter!("landing.feed.lookup_error_total").increment(1);
                nak_delivery(delivery.ack.as_ref(), sequence).await;
                return Disposition::Deferred;
            }
            Err(e) => {
                warn!("Unreadable plane for notification #{}: {}", sequence, e);
                metrics::counter!("landing.feed.malformed_total").increment(1);
                ack_delivery(delivery.ack.as_ref(), sequence).await;
                return Disposition::Malformed;
            }
        };

        let Some(event) = plane.landing_event(sequence) else {
            if plane.is_airborne() && looked_up {
                warn!(
                    "Plane {} is airborne at lookup for notification #{}, a landing it reported is not counted",
                    plane.id, sequence
                );
                metrics::counter!("landing.feed.airborne_at_lookup_total").increment(1);
                ack_delivery(delivery.ack.as_ref(), sequence).await;
                return Disposition::AirborneAtLookup;
            }
            if plane.is_airborne() {
                debug!("Plane {} departed, nothing to aggregate", plane.id);
                metrics::counter!("landing.feed.departure_total").increment(1);
                ack_delivery(delivery.ack.as_ref(), sequence).await;
                return Disposition::Departure;
            }
            warn!(
                "Plane {} landed at {:?} without a landing time, skipping",
                plane.id, plane.landed_at
            );
            metrics::counter!("landing.feed.malformed_total").increment(1);
            ack_delivery(delivery.ack.as_ref(), sequence).await;
            return Disposition::Malformed;
        };

        debug!(
            "Plane {} landed at {} on {}",
            event.plane_id, event.landed_at, event.landed_on
        );
        match self.pool.dispatch(event, Some(delivery.ack.clone())).await {
            Ok(_ticket) => {
                metrics::counter!("landing.feed.dispatched_total").increment(1);
                Disposition::Dispatched
            }
            Err(DispatchError::PoolClosed) => {
                warn!("Aggregator pool closed, leaving notification #{} for redelivery", sequence);
                Disposition::Deferred
            }
            Err(e) => {
                error!("Failed to dispatch notification #{}: {}", sequence, e);
                nak_delivery(delivery.ack.as_ref(), sequence).await;
                Disposition::Deferred
            }
        }
    }

    /// The post-image carried by the notification, or the current document
    async fn resolve_document(
        &self,
        notification: ChangeNotification,
    ) -> Result<Option<Plane>, GatewayError> {
        if let Some(plane) = notification.full_document {
            return Ok(Some(plane));
        }
        let plane = self.gateway.get_plane(&notification.document_key).await?;
        if plane.is_none() {
            warn!(
                "Plane {} from change notification no longer exists",
                notification.document_key
            );
        }
        Ok(plane)
    }
}
