mod common;

use common::{fleet, minutes_after_t0, slow_fleet, t0};
use contrail::aggregator::{LegAggregator, LegOutcome, RetryPolicy, SkipReason};
use contrail::cities::City;
use contrail::geo::{GeoPoint, great_circle_distance_miles};
use contrail::memory_feed::{RecordingAck, Settlement};
use contrail::memory_gateway::InMemoryGateway;
use contrail::planes::{LandingEvent, Plane};
use contrail::worker_pool::{AggregatorPool, PoolConfig};
use std::sync::Arc;
use std::time::Duration;

const ROTATION: &[&str] = &["london", "paris", "berlin", "madrid", "rome"];

fn quick_retries() -> RetryPolicy {
    RetryPolicy {
        store_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        conflict_retries: 2,
    }
}

fn pool_for(gateway: &Arc<InMemoryGateway>) -> AggregatorPool {
    AggregatorPool::new(
        LegAggregator::new(gateway.clone(), quick_retries()),
        PoolConfig::default(),
    )
}

fn landing(plane_id: &str, from: &str, to: &str, minutes: i64, sequence: u64) -> LandingEvent {
    LandingEvent {
        plane_id: plane_id.to_string(),
        departed_from: Some(from.to_string()),
        landed_at: to.to_string(),
        landed_on: minutes_after_t0(minutes),
        sequence,
    }
}

/// The n-th leg of a plane flying around the rotation
fn nth_leg(plane_id: &str, n: usize) -> LandingEvent {
    let from = ROTATION[n % ROTATION.len()];
    let to = ROTATION[(n + 1) % ROTATION.len()];
    landing(plane_id, from, to, 90 * (n as i64 + 1), n as u64)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_landings_match_sequential_application_in_arrival_order() {
    let planes = ["p1", "p2", "p3"];
    let gateway = slow_fleet(&planes, Duration::from_millis(1));
    let pool = pool_for(&gateway);

    // 6 producers race each other, each owning a slice of every plane's legs
    let mut producers = Vec::new();
    for producer in 0..6usize {
        let pool = pool.clone();
        producers.push(tokio::spawn(async move {
            let mut dispatched = Vec::new();
            for n in (producer..24).step_by(6) {
                for plane in planes {
                    let event = nth_leg(plane, n);
                    let ticket = pool.dispatch(event.clone(), None).await.unwrap();
                    dispatched.push((ticket.arrival(), event, ticket));
                }
            }
            dispatched
        }));
    }

    let mut arrivals = Vec::new();
    for producer in producers {
        for (arrival, event, ticket) in producer.await.unwrap() {
            ticket.outcome().await.unwrap();
            arrivals.push((arrival, event));
        }
    }
    pool.shutdown().await;
    arrivals.sort_by_key(|(arrival, _)| *arrival);

    // Same events, one at a time, in arrival order
    let reference = fleet(&planes);
    let aggregator = LegAggregator::new(reference.clone(), quick_retries());
    for (_, event) in &arrivals {
        aggregator.process_landing(event).await.unwrap();
    }

    for plane in planes {
        let concurrent = gateway.plane(plane).unwrap();
        let sequential = reference.plane(plane).unwrap();
        assert_eq!(concurrent.statistics, sequential.statistics, "plane {plane}");
        assert_eq!(concurrent.statistics_as_of, sequential.statistics_as_of);
        assert_eq!(concurrent.departed_from, sequential.departed_from);
    }
}

#[tokio::test]
async fn landings_of_one_plane_run_in_dispatch_order() {
    let gateway = slow_fleet(&["p1"], Duration::from_millis(2));
    let pool = pool_for(&gateway);

    let legs = [
        landing("p1", "london", "paris", 60, 1),
        landing("p1", "paris", "berlin", 150, 2),
        landing("p1", "berlin", "rome", 260, 3),
    ];
    let mut tickets = Vec::new();
    for leg in &legs {
        tickets.push(pool.dispatch(leg.clone(), None).await.unwrap());
    }
    for ticket in tickets {
        let outcome = ticket.outcome().await.unwrap();
        assert!(matches!(outcome, LegOutcome::Applied { .. }), "{outcome:?}");
    }

    let plane = gateway.plane("p1").unwrap();
    assert!((plane.statistics.airtime_minutes - 260.0).abs() < 1e-9);
    assert_eq!(plane.departed_from.as_deref(), Some("rome"));
    assert_eq!(gateway.write_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn different_planes_are_processed_in_parallel() {
    let latency = Duration::from_millis(100);
    let ids: Vec<String> = (0..10).map(|i| format!("p{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let gateway = slow_fleet(&id_refs, latency);
    let pool = pool_for(&gateway);

    let start = tokio::time::Instant::now();
    let mut tickets = Vec::new();
    for id in &ids {
        let event = landing(id, "london", "paris", 75, 1);
        tickets.push(pool.dispatch(event, None).await.unwrap());
    }
    for ticket in tickets {
        ticket.outcome().await.unwrap();
    }
    let elapsed = start.elapsed();

    // three store calls per landing; one plane after another would take 3s
    assert!(elapsed < latency * 3 * 2, "took {elapsed:?}");
    assert_eq!(gateway.write_count(), 10);
}

#[tokio::test]
async fn shutdown_drains_queued_landings_and_settles_them() {
    let gateway = slow_fleet(&["p1", "p2"], Duration::from_millis(3));
    let pool = pool_for(&gateway);

    let mut acks = Vec::new();
    for n in 0..5 {
        for plane in ["p1", "p2"] {
            let ack = Arc::new(RecordingAck::new());
            // tickets are dropped, the pool still finishes the work
            pool.dispatch(nth_leg(plane, n), Some(ack.clone()))
                .await
                .unwrap();
            acks.push(ack);
        }
    }

    pool.shutdown().await;

    assert!(
        acks.iter()
            .all(|ack| ack.settlement() == Some(Settlement::Acked))
    );
    assert_eq!(gateway.write_count(), 10);
    assert_eq!(pool.active_planes(), 0);
    assert_eq!(
        gateway.plane("p1").unwrap().statistics_as_of,
        Some(nth_leg("p1", 4).landed_on)
    );
}

#[tokio::test]
async fn unknown_city_leaves_statistics_unchanged() {
    let gateway = fleet(&["p1"]);
    let pool = pool_for(&gateway);
    let before = gateway.plane("p1").unwrap();

    let outcome = pool
        .dispatch(landing("p1", "atlantis", "paris", 60, 1), None)
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        LegOutcome::Skipped(SkipReason::ReferenceDataIncomplete)
    );
    assert_eq!(gateway.plane("p1").unwrap(), before);
}

#[tokio::test]
async fn first_leg_between_two_cities() {
    let gateway = Arc::new(InMemoryGateway::new());
    let a = GeoPoint::new(0.0, 0.0);
    let b = GeoPoint::new(0.0, 1.0);
    gateway.insert_city(City::new("A", "XX", a));
    gateway.insert_city(City::new("B", "XX", b));
    gateway.insert_plane(Plane::registered_at("N1", "A", a, t0()));
    let pool = pool_for(&gateway);

    let outcome = pool
        .dispatch(landing("N1", "A", "B", 60, 7), None)
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();
    pool.shutdown().await;

    let expected = great_circle_distance_miles(&a, &b);
    let LegOutcome::Applied { statistics, .. } = outcome else {
        panic!("expected the leg to be applied, got {outcome:?}");
    };
    assert!((statistics.total_distance_miles - expected).abs() < 1e-9);
    assert!((statistics.distance_since_maintenance_miles - expected).abs() < 1e-9);
    assert!((statistics.airtime_minutes - 60.0).abs() < 1e-9);
    assert!(!statistics.maintenance_required);
    assert_eq!(gateway.plane("N1").unwrap().statistics, statistics);
}
