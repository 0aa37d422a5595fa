use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::aggregator::SkipReason;

/// Install the Prometheus recorder
///
/// Returns a handle that renders the current metrics for scraping.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // 1ms .. 10s
        .set_buckets_for_metric(
            Matcher::Suffix("duration_ms".to_string()),
            &[
                1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            ],
        )
        .context("Failed to set histogram buckets")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Updates uptime and memory gauges every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status")
                && let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:"))
                && let Some(kb) = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|kb| kb.parse::<f64>().ok())
            {
                metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Zero every aggregator metric so it shows up before the first landing
pub fn initialize_aggregator_metrics() {
    // change feed
    metrics::counter!("landing.feed.received_total").absolute(0);
    metrics::counter!("landing.feed.dispatched_total").absolute(0);
    metrics::counter!("landing.feed.departure_total").absolute(0);
    metrics::counter!("landing.feed.airborne_at_lookup_total").absolute(0);
    metrics::counter!("landing.feed.ignored_total").absolute(0);
    metrics::counter!("landing.feed.malformed_total").absolute(0);
    metrics::counter!("landing.feed.lookup_error_total").absolute(0);
    metrics::counter!("landing.feed.ack_error_total").absolute(0);
    metrics::counter!("landing.feed.error_total").absolute(0);
    metrics::counter!("landing.feed.resubscribe_total").absolute(0);

    // worker pool
    metrics::gauge!("aggregator.pool.active_planes").set(0.0);

    // aggregation
    metrics::counter!("aggregator.leg.applied_total").absolute(0);
    metrics::counter!("aggregator.leg.failed_total").absolute(0);
    for reason in SkipReason::ALL {
        metrics::counter!("aggregator.leg.skipped_total", "reason" => reason.as_str()).absolute(0);
    }
    metrics::counter!("aggregator.store.retry_total").absolute(0);
    metrics::counter!("aggregator.update.conflict_total").absolute(0);
}

/// Serve `/metrics` on `port` until the process exits
pub async fn start_metrics_server(port: u16) -> Result<()> {
    let handle = init_metrics()?;
    tokio::spawn(process_metrics_task());

    let app = Router::new().route("/metrics", get(move || std::future::ready(handle.render())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", addr))?;
    info!("Serving metrics on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server failed: {}", e);
        }
    });
    Ok(())
}
