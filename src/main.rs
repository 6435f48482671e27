//! intake-relay CLI entrypoint

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use intake_relay::cli::Cli;
use intake_relay::config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let missing = config::missing_required_env();
    if !missing.is_empty() {
        warn!("Missing required environment variables: {}", missing.join(", "));
    }

    // Parse and execute CLI
    let cli = Cli::parse();
    cli.execute().await
}
