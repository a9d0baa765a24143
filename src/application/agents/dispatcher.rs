use crate::application::agents::lane::LaneMessage;
use crate::domain::errors::FeedError;
use crate::domain::types::Tick;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Dropped-input counters, shared with whoever wants to report them.
#[derive(Debug, Default)]
pub struct FeedCounters {
    pub dropped_stale: AtomicU64,
    pub dropped_bad: AtomicU64,
}

impl FeedCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Feed intake: validates ticks and routes each to its symbol's lane.
///
/// Per-symbol timestamps must not run backwards; violators are dropped with
/// a counter increment, as is anything malformed or for an unknown symbol.
pub struct TickDispatcher {
    lanes: HashMap<String, mpsc::Sender<LaneMessage>>,
    last_ts: HashMap<String, i64>,
    counters: Arc<FeedCounters>,
}

impl TickDispatcher {
    pub fn new(
        lanes: HashMap<String, mpsc::Sender<LaneMessage>>,
        counters: Arc<FeedCounters>,
    ) -> Self {
        Self {
            lanes,
            last_ts: HashMap::new(),
            counters,
        }
    }

    /// Validate one tick and record its timestamp. Pure bookkeeping; the
    /// send to the lane happens in `run`.
    pub fn admit(&mut self, tick: &Tick) -> Result<(), FeedError> {
        if !self.lanes.contains_key(&tick.symbol) {
            return Err(FeedError::BadInput {
                symbol: tick.symbol.clone(),
                reason: "unknown symbol".to_string(),
            });
        }
        if tick.price <= Decimal::ZERO {
            return Err(FeedError::BadInput {
                symbol: tick.symbol.clone(),
                reason: format!("non-positive price {}", tick.price),
            });
        }
        if let Some(&last) = self.last_ts.get(&tick.symbol)
            && tick.ts_ms < last
        {
            return Err(FeedError::StaleTick {
                symbol: tick.symbol.clone(),
                ts_ms: tick.ts_ms,
                last_ts_ms: last,
            });
        }
        self.last_ts.insert(tick.symbol.clone(), tick.ts_ms);
        Ok(())
    }

    pub async fn run(
        mut self,
        mut feed_rx: mpsc::Receiver<Tick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("tick dispatcher started for {} symbols", self.lanes.len());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                tick = feed_rx.recv() => {
                    let Some(tick) = tick else { break };
                    match self.admit(&tick) {
                        Ok(()) => {
                            let lane = &self.lanes[&tick.symbol];
                            if lane.send(LaneMessage::Tick(tick)).await.is_err() {
                                warn!("lane closed, dispatcher stopping");
                                break;
                            }
                        }
                        Err(FeedError::StaleTick { symbol, ts_ms, last_ts_ms }) => {
                            self.counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
                            warn!(symbol, ts_ms, last_ts_ms, "stale tick dropped");
                        }
                        Err(e) => {
                            self.counters.dropped_bad.fetch_add(1, Ordering::Relaxed);
                            warn!("bad tick dropped: {e}");
                        }
                    }
                }
            }
        }
        info!("tick dispatcher stopped");
    }
}
