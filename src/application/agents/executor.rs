use crate::domain::ports::BrokerGateway;
use crate::domain::types::{FillEvent, IntentEvent};
use crate::infrastructure::bus::consumer::{Delivered, GroupConsumer};
use crate::infrastructure::bus::producer::StreamProducer;
use crate::infrastructure::bus::Backoff;
use crate::infrastructure::persistence::repositories::ProcessedLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Executor role: one member of a signal-stream consumer group.
///
/// Claims intent batches, places them with the broker exactly once (the
/// processed ledger makes re-deliveries no-ops), publishes the resulting
/// fill and acks. Transient broker failures leave the entry unacked so the
/// group re-delivers it; a REJECTED outcome is a business result and is
/// published and acked like a fill.
pub struct ExecutorAgent {
    consumer: GroupConsumer<IntentEvent>,
    fill_producer: StreamProducer<FillEvent>,
    broker: Arc<dyn BrokerGateway>,
    ledger: ProcessedLedger,
    batch_size: usize,
    read_block: Duration,
    claim_interval: Duration,
    claim_idle_ms: i64,
}

impl ExecutorAgent {
    pub fn new(
        consumer: GroupConsumer<IntentEvent>,
        fill_producer: StreamProducer<FillEvent>,
        broker: Arc<dyn BrokerGateway>,
        ledger: ProcessedLedger,
        batch_size: usize,
        read_block: Duration,
        claim_interval: Duration,
        claim_idle_ms: i64,
    ) -> Self {
        Self {
            consumer,
            fill_producer,
            broker,
            ledger,
            batch_size,
            read_block,
            claim_interval,
            claim_idle_ms,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            group = self.consumer.group(),
            consumer = self.consumer.consumer(),
            "executor started"
        );

        // Resume whatever this consumer left unacked, then read only new.
        match self.consumer.pending_for_me().await {
            Ok(pending) if !pending.is_empty() => {
                info!(n = pending.len(), "resuming pending intents");
                self.process_batch(pending).await;
            }
            Ok(_) => {}
            Err(e) => error!("failed to read pending intents: {e:#}"),
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
                            self.process_batch(batch).await;
                        }
                        Err(e) => {
                            warn!("intent read failed, backing off: {e:#}");
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                    }
                }
                _ = claim_tick.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    match self.consumer.claim_idle(self.claim_idle_ms, now_ms).await {
                        Ok(claimed) => self.process_batch(claimed).await,
                        Err(e) => warn!("pending claim failed: {e:#}"),
                    }
                }
            }
        }

        // Guaranteed disconnect on the way out, whatever got us here.
        if let Err(e) = self.broker.disconnect().await {
            warn!("broker disconnect failed: {e:#}");
        }
        info!("executor stopped");
    }

    async fn process_batch(&self, batch: Vec<Delivered<IntentEvent>>) {
        for delivered in batch {
            self.process_one(delivered).await;
        }
    }

    #[instrument(skip(self, delivered), fields(
        symbol = %delivered.event.symbol,
        action = %delivered.event.action,
        intent_id = %delivered.event.event_id,
    ))]
    async fn process_one(&self, delivered: Delivered<IntentEvent>) {
        let intent = &delivered.event;
        let now_ms = chrono::Utc::now().timestamp_millis();

        // Already executed in a previous delivery: just clear the pending
        // entry, the fill is on the stream.
        match self.ledger.is_processed(&intent.event_id.to_string()).await {
            Ok(true) => {
                info!("intent already processed, acking re-delivery");
                let _ = self.consumer.ack(delivered.entry_id).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("ledger lookup failed, leaving unacked: {e:#}");
                return;
            }
        }

        let fill = match self.broker.execute(intent).await {
            Ok(fill) => fill,
            Err(e) => {
                // Transient: stays pending, re-claimed after the idle
                // threshold.
                warn!(delivery_count = delivered.delivery_count, "broker execute failed: {e:#}");
                return;
            }
        };

        info!(status = %fill.status, fill_price = %fill.fill_price, "broker outcome");

        // One fill per intent: the dedupe key absorbs a crash between
        // publish and ack.
        let dedupe = format!("fill:{}", intent.event_id);
        if let Err(e) = self
            .fill_producer
            .append(&fill.symbol, Some(&dedupe), now_ms, &fill)
            .await
        {
            warn!("fill publish failed, leaving unacked: {e:#}");
            return;
        }
        if let Err(e) = self.ledger.mark(&intent.event_id.to_string(), now_ms).await {
            warn!("ledger mark failed: {e:#}");
        }
        if let Err(e) = self.consumer.ack(delivered.entry_id).await {
            warn!("ack failed: {e:#}");
        }
    }
}
