//! Signal generator - headless
//!
//! Runs the tick-to-intent half of the pipeline: market feed in, candles,
//! indicators, strategy evaluation, intents out onto the durable signal
//! stream, reconciled fills back into the per-symbol books.
//!
//! # Usage
//! ```sh
//! SYMBOLS=USDJPY,EURUSD cargo run --bin generator
//! ```

use anyhow::Result;
use meanrev::application::system::Application;
use meanrev::config::{Config, Mode};
use meanrev::domain::ports::MarketDataService;
use meanrev::infrastructure::feed::mock::MockMarketFeed;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("meanrev generator {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: mode={:?}, symbols={:?}, db={}",
        config.mode, config.symbols, config.database_url
    );

    let feed: Arc<dyn MarketDataService> = match config.mode {
        Mode::Mock => Arc::new(MockMarketFeed::new()),
    };

    let app = Application::build(config, feed).await?;
    let handle = app.start().await?;

    info!("Generator running. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;

    // Lanes drain, flush and snapshot before the process exits.
    handle.shutdown().await;
    Ok(())
}
