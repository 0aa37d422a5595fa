mod shutdown;

use anyhow::{Context, Result};
use contrail::aggregator::LegAggregator;
use contrail::config::{ContrailConfig, config_path};
use contrail::gateway::FleetGateway;
use contrail::jetstream_feed::JetStreamChangeFeed;
use contrail::landing_consumer::LandingConsumer;
use contrail::metrics::{initialize_aggregator_metrics, start_metrics_server};
use contrail::pg_gateway::{PgFleetGateway, create_pool};
use contrail::worker_pool::AggregatorPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn handle_run(config: Option<PathBuf>, metrics_port: Option<u16>) -> Result<()> {
    let path = config_path(config);
    let mut config = ContrailConfig::resolve(path.as_deref())?;
    if let Some(port) = metrics_port {
        config.metrics.port = Some(port);
    }

    info!(
        "Starting contrail {} (config: {})",
        env!("CARGO_PKG_VERSION"),
        path.as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string())
    );

    if let Some(port) = config.metrics.port {
        start_metrics_server(port).await?;
    }
    initialize_aggregator_metrics();

    let pool = create_pool(
        &config.store.database_url,
        config.store.max_connections,
        Duration::from_millis(config.store.connection_timeout_ms),
    )?;
    let gateway: Arc<dyn FleetGateway> = Arc::new(PgFleetGateway::new(pool));

    let aggregator = LegAggregator::new(gateway.clone(), config.aggregator.retry_policy());
    let workers = AggregatorPool::new(aggregator, config.aggregator.pool_config());

    let feed = JetStreamChangeFeed::connect(
        &config.feed.nats_url,
        config.feed.stream_name.clone(),
        config.feed.subject_prefix.clone(),
        config.feed.consumer_name.clone(),
        config.feed.max_ack_pending,
    )
    .await
    .context("Failed to set up the change feed")?;

    let consumer = LandingConsumer::new(
        Arc::new(feed),
        gateway,
        workers,
        config.feed.retry_policy(),
    );

    let shutdown = CancellationToken::new();
    shutdown::spawn_shutdown_handler(shutdown.clone());

    let stats = consumer.run(shutdown).await?;
    info!(
        "Shut down cleanly after {} subscription(s) and {} landing(s)",
        stats.subscriptions, stats.dispatched
    );
    Ok(())
}
