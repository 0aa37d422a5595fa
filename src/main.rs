use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use contrail::log_format::FleetLogFormat;

mod commands;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "contrail")]
#[command(version, about = "Per-plane flight statistics from landing notifications")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume landing notifications and keep plane statistics up to date
    Run {
        /// TOML configuration file (defaults to $CONTRAIL_CONFIG or ./contrail.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(FleetLogFormat)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            metrics_port,
        } => commands::handle_run(config, metrics_port).await,
    }
}
