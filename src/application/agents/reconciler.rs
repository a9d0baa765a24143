use crate::application::agents::lane::LaneMessage;
use crate::domain::types::FillEvent;
use crate::infrastructure::bus::Backoff;
use crate::infrastructure::bus::consumer::{Delivered, GroupConsumer};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Generator-side fill intake.
///
/// Joins the fill stream under the generator's own consumer group, routes
/// each fill onto its symbol's lane inbox and acks once the lane has
/// accepted it. A crash between ack and apply is covered by the startup
/// replay from the last snapshot.
pub struct FillReconciler {
    consumer: GroupConsumer<FillEvent>,
    lanes: HashMap<String, mpsc::Sender<LaneMessage>>,
    batch_size: usize,
    read_block: Duration,
    claim_interval: Duration,
    claim_idle_ms: i64,
}

impl FillReconciler {
    pub fn new(
        consumer: GroupConsumer<FillEvent>,
        lanes: HashMap<String, mpsc::Sender<LaneMessage>>,
        batch_size: usize,
        read_block: Duration,
        claim_interval: Duration,
        claim_idle_ms: i64,
    ) -> Self {
        Self {
            consumer,
            lanes,
            batch_size,
            read_block,
            claim_interval,
            claim_idle_ms,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(group = self.consumer.group(), "fill reconciler started");

        // Resume in-flight deliveries from a previous run first.
        match self.consumer.pending_for_me().await {
            Ok(pending) if !pending.is_empty() => {
                info!(n = pending.len(), "resuming pending fills");
                self.dispatch_batch(pending).await;
            }
            Ok(_) => {}
            Err(e) => error!("failed to read pending fills: {e:#}"),
        }

        let mut claim_tick = tokio::time::interval(self.claim_interval);
        claim_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = self.consumer.read_batch(self.batch_size, self.read_block) => {
                    match result {
                        Ok(batch) => {
                            backoff.reset();
                            self.dispatch_batch(batch).await;
                        }
                        Err(e) => {
                            warn!("fill read failed, backing off: {e:#}");
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                    }
                }
                _ = claim_tick.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    match self.consumer.claim_idle(self.claim_idle_ms, now_ms).await {
                        Ok(claimed) => self.dispatch_batch(claimed).await,
                        Err(e) => warn!("pending claim failed: {e:#}"),
                    }
                }
            }
        }
        info!("fill reconciler stopped");
    }

    async fn dispatch_batch(&self, batch: Vec<Delivered<FillEvent>>) {
        for delivered in batch {
            let Some(lane) = self.lanes.get(&delivered.symbol) else {
                // A fill for a symbol this run does not trade: leave it
                // unacked for whichever instance owns the symbol.
                warn!(symbol = %delivered.symbol, "fill for unmanaged symbol left pending");
                continue;
            };
            if lane
                .send(LaneMessage::ApplyFill(delivered.event))
                .await
                .is_err()
            {
                warn!(symbol = %delivered.symbol, "lane closed, fill left pending");
                continue;
            }
            if let Err(e) = self.consumer.ack(delivered.entry_id).await {
                warn!(entry_id = delivered.entry_id, "ack failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Direction, FillStatus, IntentAction};
    use crate::infrastructure::bus::FILL_STREAM;
    use crate::infrastructure::bus::producer::StreamProducer;
    use crate::infrastructure::persistence::database::Database;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn fill(symbol: &str) -> FillEvent {
        FillEvent {
            event_id: Uuid::new_v4(),
            intent_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action: IntentAction::Init,
            direction: Direction::Long,
            lot_id: Some(Uuid::new_v4()),
            fill_price: dec!(98.9),
            filled_size: dec!(1),
            ts_ms: 1_000,
            status: FillStatus::Filled,
            ma_thr_at_entry: dec!(0.01),
        }
    }

    #[tokio::test]
    async fn test_fills_routed_to_lane_and_acked() {
        let db = Database::in_memory().await.unwrap();
        let producer: StreamProducer<FillEvent> =
            StreamProducer::new(db.pool.clone(), FILL_STREAM);

        let consumer =
            GroupConsumer::new(db.pool.clone(), FILL_STREAM, "generator", "generator-1");
        consumer.ensure_group(0).await.unwrap();

        producer
            .append("USDJPY", None, 1_000, &fill("USDJPY"))
            .await
            .unwrap();

        let (lane_tx, mut lane_rx) = mpsc::channel(16);
        let mut lanes = HashMap::new();
        lanes.insert("USDJPY".to_string(), lane_tx);

        let check_consumer: GroupConsumer<FillEvent> =
            GroupConsumer::new(db.pool.clone(), FILL_STREAM, "generator", "checker");

        let reconciler = FillReconciler::new(
            consumer,
            lanes,
            16,
            Duration::from_millis(200),
            Duration::from_secs(30),
            60_000,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(shutdown_rx));

        let msg = tokio::time::timeout(Duration::from_secs(2), lane_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, LaneMessage::ApplyFill(f) if f.symbol == "USDJPY"));

        // Give the ack a moment, then verify the pending list drained.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(check_consumer.pending_count().await.unwrap(), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unmanaged_symbol_left_pending() {
        let db = Database::in_memory().await.unwrap();
        let producer: StreamProducer<FillEvent> =
            StreamProducer::new(db.pool.clone(), FILL_STREAM);

        let consumer =
            GroupConsumer::new(db.pool.clone(), FILL_STREAM, "generator", "generator-1");
        consumer.ensure_group(0).await.unwrap();

        producer
            .append("EURUSD", None, 1_000, &fill("EURUSD"))
            .await
            .unwrap();

        let (lane_tx, _lane_rx) = mpsc::channel(16);
        let mut lanes = HashMap::new();
        lanes.insert("USDJPY".to_string(), lane_tx);

        let check_consumer: GroupConsumer<FillEvent> =
            GroupConsumer::new(db.pool.clone(), FILL_STREAM, "generator", "checker");

        let reconciler = FillReconciler::new(
            consumer,
            lanes,
            16,
            Duration::from_millis(200),
            Duration::from_secs(30),
            60_000,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconciler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(check_consumer.pending_count().await.unwrap(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
