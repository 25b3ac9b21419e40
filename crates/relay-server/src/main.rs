//! # Circle Relay
//!
//! Realtime comment relay for social circles.
//!
//! ## Usage
//!
//! ```bash
//! # Run with the secret from the environment
//! RELAY_JWT_SECRET=... circle-relay
//!
//! # Run with custom config
//! circle-relay --config /path/to/circle-relay.toml
//!
//! # Override bind address and allowed origin
//! RELAY_PORT=3001 RELAY_ALLOWED_ORIGIN=https://app.example.com circle-relay
//! ```

use anyhow::Result;
use circle_relay_server::{cli::Args, config, handlers, metrics};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "circle_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!(
        "Starting circle relay on {}:{} (allowed origin: {})",
        config.host,
        config.port,
        config.allowed_origin
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
