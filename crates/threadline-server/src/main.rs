//! # Threadline Server
//!
//! Chat delivery server: WebSocket sessions, message fanout and history.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! threadline
//!
//! # Run with a config file (threadline.toml in the working directory,
//! # /etc/threadline/ or ~/.config/threadline/)
//! threadline
//!
//! # Run with environment variables
//! THREADLINE_PORT=8080 THREADLINE_HOST=0.0.0.0 threadline
//! ```

mod config;
mod frames;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadline=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        "Starting Threadline server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
