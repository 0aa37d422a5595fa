//! Contrail - per-plane flight statistics
//!
//! Consumes landing notifications from a change feed, computes the
//! great-circle distance of every completed leg and keeps each plane's
//! distance, airtime and maintenance statistics up to date.

pub mod aggregator;
pub mod change_feed;
pub mod cities;
pub mod cities_repo;
pub mod config;
pub mod gateway;
pub mod geo;
pub mod jetstream_feed;
pub mod landing_consumer;
pub mod log_format;
pub mod memory_feed;
pub mod memory_gateway;
pub mod metrics;
pub mod pg_gateway;
pub mod planes;
pub mod planes_repo;
pub mod schema;
pub mod statistics;
pub mod worker_pool;

pub use aggregator::{LegAggregator, LegOutcome, SkipReason};
pub use gateway::FleetGateway;
pub use landing_consumer::LandingConsumer;
pub use planes::LandingEvent;
pub use worker_pool::AggregatorPool;
