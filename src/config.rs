use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregator::RetryPolicy;
use crate::landing_consumer::FeedRetryPolicy;
use crate::worker_pool::PoolConfig;

/// Change feed connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub nats_url: String,
    pub stream_name: String,
    /// Notifications are published on `<subject_prefix>.<operationType>`
    pub subject_prefix: String,
    pub consumer_name: String,
    pub max_ack_pending: i64,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            stream_name: "FLEET_CHANGES".to_string(),
            subject_prefix: "fleet.planes".to_string(),
            consumer_name: "contrail-aggregator".to_string(),
            max_ack_pending: 1000,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            max_retries: 10,
        }
    }
}

impl FeedConfig {
    pub fn retry_policy(&self) -> FeedRetryPolicy {
        FeedRetryPolicy {
            initial_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            max_consecutive_failures: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/contrail".to_string(),
            max_connections: 10,
            connection_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub max_in_flight: usize,
    pub idle_worker_timeout_ms: u64,
    pub store_retry_attempts: u32,
    pub store_retry_base_delay_ms: u64,
    pub store_retry_max_delay_ms: u64,
    pub conflict_retries: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        let retry = RetryPolicy::default();
        Self {
            max_in_flight: pool.max_in_flight,
            idle_worker_timeout_ms: pool.idle_timeout.as_millis() as u64,
            store_retry_attempts: retry.store_attempts,
            store_retry_base_delay_ms: retry.base_delay.as_millis() as u64,
            store_retry_max_delay_ms: retry.max_delay.as_millis() as u64,
            conflict_retries: retry.conflict_retries,
        }
    }
}

impl AggregatorConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_in_flight: self.max_in_flight,
            idle_timeout: Duration::from_millis(self.idle_worker_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            store_attempts: self.store_retry_attempts.max(1),
            base_delay: Duration::from_millis(self.store_retry_base_delay_ms),
            max_delay: Duration::from_millis(self.store_retry_max_delay_ms),
            conflict_retries: self.conflict_retries,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics on this port when set
    pub port: Option<u16>,
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrailConfig {
    pub feed: FeedConfig,
    pub store: StoreConfig,
    pub aggregator: AggregatorConfig,
    pub metrics: MetricsConfig,
}

impl ContrailConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: ContrailConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Load `path` if given, otherwise defaults; then apply environment overrides
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// `DATABASE_URL` and `NATS_URL` win over the file
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.store.database_url = url;
        }
        if let Some(url) = lookup("NATS_URL").filter(|v| !v.is_empty()) {
            self.feed.nats_url = url;
        }
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. explicit `--config`
/// 2. `CONTRAIL_CONFIG` env var
/// 3. `./contrail.toml` if it exists
pub fn config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    if let Ok(path) = std::env::var("CONTRAIL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from("./contrail.toml");
    local.exists().then_some(local)
}
