//! Executor - headless
//!
//! Joins the signal stream under a named consumer group, places each claimed
//! intent with the broker, publishes the fill and acknowledges. Several
//! executors under the same group share the stream; idle entries of a dead
//! member are re-claimed automatically.
//!
//! # Usage
//! ```sh
//! cargo run --bin executor -- --group executors --name executor-1
//! ```

use anyhow::Result;
use clap::Parser;
use meanrev::application::agents::executor::ExecutorAgent;
use meanrev::config::{Config, Mode};
use meanrev::domain::ports::BrokerGateway;
use meanrev::infrastructure::broker::mock::MockBroker;
use meanrev::infrastructure::bus::consumer::GroupConsumer;
use meanrev::infrastructure::bus::producer::StreamProducer;
use meanrev::infrastructure::bus::{FILL_STREAM, SIGNAL_STREAM};
use meanrev::infrastructure::persistence::database::Database;
use meanrev::infrastructure::persistence::repositories::ProcessedLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(about = "Signal-stream executor")]
struct Args {
    /// Consumer group to join; overrides CONSUMER_GROUP.
    #[arg(long)]
    group: Option<String>,

    /// Consumer name within the group; overrides CONSUMER_NAME.
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(group) = args.group {
        config.consumer_group = group;
    }
    if let Some(name) = args.name {
        config.consumer_name = name;
    }

    info!(
        "meanrev executor {} starting (group={}, name={})...",
        env!("CARGO_PKG_VERSION"),
        config.consumer_group,
        config.consumer_name
    );

    let db = Database::new(&config.database_url).await?;

    let broker: Arc<dyn BrokerGateway> = match config.mode {
        Mode::Mock => Arc::new(MockBroker::new()),
    };

    let consumer = GroupConsumer::new(
        db.pool.clone(),
        SIGNAL_STREAM,
        config.consumer_group.clone(),
        config.consumer_name.clone(),
    );
    consumer
        .ensure_group(chrono::Utc::now().timestamp_millis())
        .await?;

    let agent = ExecutorAgent::new(
        consumer,
        StreamProducer::new(db.pool.clone(), FILL_STREAM),
        broker,
        ProcessedLedger::new(db.pool.clone(), config.consumer_group.clone()),
        config.read_batch_size,
        Duration::from_millis(config.read_block_ms),
        Duration::from_secs(config.claim_interval_secs),
        (config.claim_idle_threshold_secs * 1000) as i64,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(agent.run(shutdown_rx));

    info!("Executor running. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;

    // Finish the current batch, leave the rest pending for re-claim.
    let _ = shutdown_tx.send(true);
    task.await?;
    Ok(())
}
