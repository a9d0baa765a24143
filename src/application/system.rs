use crate::application::agents::dispatcher::{FeedCounters, TickDispatcher};
use crate::application::agents::lane::{LaneMessage, SymbolLane};
use crate::application::agents::reconciler::FillReconciler;
use crate::config::Config;
use crate::domain::ports::MarketDataService;
use crate::domain::types::{FillEvent, IntentEvent};
use crate::infrastructure::bus::consumer::GroupConsumer;
use crate::infrastructure::bus::producer::StreamProducer;
use crate::infrastructure::bus::{events_after_ts, FILL_STREAM, SIGNAL_STREAM};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{QuarantineStore, SnapshotStore};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const LANE_INBOX_CAPACITY: usize = 256;

/// Handle to the running generator: flip the shutdown switch and join.
pub struct SystemHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub counters: Arc<FeedCounters>,
}

impl SystemHandle {
    /// Signal every task and wait for the lanes to flush and snapshot.
    pub async fn shutdown(self) {
        info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
        for result in futures_util::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("task ended abnormally: {e}");
            }
        }
        info!("all tasks stopped");
    }
}

/// The generator process: one lane per symbol, the dispatcher in front,
/// the reconciler behind, all sharing one database and one shutdown switch.
pub struct Application {
    pub config: Config,
    pub db: Database,
    feed: Arc<dyn MarketDataService>,
}

impl Application {
    pub async fn build(config: Config, feed: Arc<dyn MarketDataService>) -> Result<Self> {
        info!("building generator (symbols: {:?})", config.symbols);
        let db = Database::new(&config.database_url)
            .await
            .context("initialize database")?;
        Ok(Self { config, db, feed })
    }

    pub async fn start(&self) -> Result<SystemHandle> {
        let pool = self.db.pool.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();

        let signal_producer: Arc<StreamProducer<IntentEvent>> =
            Arc::new(StreamProducer::new(pool.clone(), SIGNAL_STREAM));
        let snapshots = Arc::new(SnapshotStore::new(pool.clone()));
        let quarantine = Arc::new(QuarantineStore::new(pool.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let snapshot_interval = Duration::from_secs(self.config.snapshot_interval_secs);
        let mut tasks = Vec::new();
        let mut lane_txs: HashMap<String, mpsc::Sender<LaneMessage>> = HashMap::new();

        for symbol in &self.config.symbols {
            let (tx, rx) = mpsc::channel(LANE_INBOX_CAPACITY);

            let snapshot = snapshots.load(symbol).await?;
            let replay_from = snapshot.as_ref().map(|s| s.taken_ts_ms);
            let mut lane = SymbolLane::new(
                symbol,
                self.config.strategy.clone(),
                signal_producer.clone(),
                snapshots.clone(),
                quarantine.clone(),
                snapshot,
            );

            // Fills appended after the snapshot was taken are re-applied so
            // the restored book catches up before the first live tick.
            if let Some(after_ts) = replay_from {
                let replay: Vec<FillEvent> =
                    events_after_ts(&pool, FILL_STREAM, symbol, after_ts).await?;
                if !replay.is_empty() {
                    info!(symbol = %symbol, n = replay.len(), "replaying fills newer than snapshot");
                }
                for fill in replay {
                    lane.apply_fill(fill).await;
                }
            }

            tasks.push(tokio::spawn(lane.run(
                rx,
                shutdown_rx.clone(),
                snapshot_interval,
            )));
            lane_txs.insert(symbol.clone(), tx);
        }

        // Reconciler joins the fill stream under the generator's group.
        let fill_consumer: GroupConsumer<FillEvent> = GroupConsumer::new(
            pool.clone(),
            FILL_STREAM,
            "generator",
            format!("generator-{}", std::process::id()),
        );
        fill_consumer.ensure_group(now_ms).await?;
        let reconciler = FillReconciler::new(
            fill_consumer,
            lane_txs.clone(),
            self.config.read_batch_size,
            Duration::from_millis(self.config.read_block_ms),
            Duration::from_secs(self.config.claim_interval_secs),
            (self.config.claim_idle_threshold_secs * 1000) as i64,
        );
        tasks.push(tokio::spawn(reconciler.run(shutdown_rx.clone())));

        // Dispatcher last, once every lane is ready to receive.
        let counters = Arc::new(FeedCounters::new());
        let feed_rx = self
            .feed
            .subscribe(self.config.symbols.clone())
            .await
            .context("subscribe to market feed")?;
        let dispatcher = TickDispatcher::new(lane_txs, counters.clone());
        tasks.push(tokio::spawn(dispatcher.run(feed_rx, shutdown_rx)));

        info!("generator running");
        Ok(SystemHandle {
            shutdown_tx,
            tasks,
            counters,
        })
    }
}
