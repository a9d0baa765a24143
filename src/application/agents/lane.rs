//! Per-symbol single-writer lane.
//!
//! One lane task owns everything for its symbol: candle aggregation,
//! indicators, the position book, cooldowns and the evaluator. Ticks and
//! reconciled fills arrive on the same inbox, which makes per-symbol
//! ordering total without a single lock on the hot path.

use crate::application::market_data::candle_aggregator::CandleAggregator;
use crate::application::market_data::indicator_cache::IndicatorCache;
use crate::application::strategy::evaluator::{self, EvalContext};
use crate::config::StrategyConfig;
use crate::domain::book::PositionBook;
use crate::domain::cooldown::CooldownRegistry;
use crate::domain::types::{FillEvent, FillStatus, IntentAction, IntentEvent, Tick};
use crate::infrastructure::bus::producer::{AppendOutcome, StreamProducer};
use crate::infrastructure::persistence::repositories::{
    QuarantineStore, SnapshotStore, SymbolSnapshot,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const APPEND_ATTEMPTS: u32 = 3;

#[derive(Debug)]
pub enum LaneMessage {
    Tick(Tick),
    ApplyFill(FillEvent),
}

pub struct SymbolLane {
    symbol: String,
    cfg: StrategyConfig,
    aggregator: CandleAggregator,
    indicators: IndicatorCache,
    book: PositionBook,
    cooldowns: CooldownRegistry,
    producer: Arc<StreamProducer<IntentEvent>>,
    snapshots: Arc<SnapshotStore>,
    quarantine: Arc<QuarantineStore>,
    /// Fill event ids applied this session; at-least-once delivery means the
    /// reconciler may hand us the same fill twice.
    applied_fills: HashSet<Uuid>,
}

impl SymbolLane {
    pub fn new(
        symbol: impl Into<String>,
        cfg: StrategyConfig,
        producer: Arc<StreamProducer<IntentEvent>>,
        snapshots: Arc<SnapshotStore>,
        quarantine: Arc<QuarantineStore>,
        snapshot: Option<SymbolSnapshot>,
    ) -> Self {
        let symbol = symbol.into();
        let mut aggregator = CandleAggregator::new(&symbol, cfg.candle_period_ms());

        let (indicators, book, cooldowns) = match snapshot {
            Some(snap) => {
                info!(symbol = %symbol, taken_ts_ms = snap.taken_ts_ms, "lane restored from snapshot");
                if let (Some(bucket), Some(close)) = (snap.current_bucket_start_ms, snap.last_close)
                {
                    aggregator.restore_bucket(bucket, close);
                }
                (
                    IndicatorCache::from_closes(cfg.ma_period, cfg.momentum_window, snap.closes),
                    snap.book,
                    snap.cooldowns,
                )
            }
            None => (
                IndicatorCache::new(cfg.ma_period, cfg.momentum_window),
                PositionBook::new(&symbol, cfg.max_lots),
                CooldownRegistry::new(),
            ),
        };

        Self {
            symbol,
            cfg,
            aggregator,
            indicators,
            book,
            cooldowns,
            producer,
            snapshots,
            quarantine,
            applied_fills: HashSet::new(),
        }
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn cooldowns(&self) -> &CooldownRegistry {
        &self.cooldowns
    }

    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<LaneMessage>,
        mut shutdown: watch::Receiver<bool>,
        snapshot_interval: Duration,
    ) {
        info!(symbol = %self.symbol, "lane started");
        let mut snapshot_tick = tokio::time::interval(snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        snapshot_tick.reset(); // skip the immediate first tick

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Finish whatever is already queued, then leave.
                        while let Ok(msg) = inbox.try_recv() {
                            self.handle(msg).await;
                        }
                        break;
                    }
                }
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = snapshot_tick.tick() => {
                    self.snapshot(chrono::Utc::now().timestamp_millis()).await;
                }
            }
        }

        self.snapshot(chrono::Utc::now().timestamp_millis()).await;
        info!(symbol = %self.symbol, "lane stopped");
    }

    pub async fn handle(&mut self, msg: LaneMessage) {
        match msg {
            LaneMessage::Tick(tick) => self.on_tick(tick).await,
            LaneMessage::ApplyFill(fill) => self.apply_fill(fill).await,
        }
    }

    /// Advance candles and indicators, then give the evaluator one shot.
    pub async fn on_tick(&mut self, tick: Tick) {
        for candle in self.aggregator.on_tick(&tick) {
            self.indicators.on_close(&candle);
        }

        if let Some(expired) = self.cooldowns.take_expired(tick.ts_ms) {
            warn!(
                symbol = %self.symbol,
                intent_id = %expired.intent.event_id,
                action = %expired.intent.action,
                "pending intent timed out without a fill, re-proposal unblocked"
            );
        }
        if self.cooldowns.pending(tick.ts_ms).is_some() {
            return;
        }

        let (Some(ma), Some(momentum)) = (self.indicators.ma(), self.indicators.momentum()) else {
            return;
        };

        let decision = evaluator::evaluate(&EvalContext {
            price: tick.price,
            ma,
            momentum,
            book: &self.book,
            scale_in_blocked: self.cooldowns.scale_in_active(tick.ts_ms),
            scale_out_blocked: self.cooldowns.scale_out_active(tick.ts_ms),
            cfg: &self.cfg,
            now_ms: tick.ts_ms,
        });

        if let Some(decision) = decision {
            let intent = decision.into_intent(
                &self.symbol,
                tick.price,
                self.book.len(),
                tick.ts_ms,
                &self.cfg,
            );
            self.publish_intent(intent, tick.ts_ms).await;
        }
    }

    async fn publish_intent(&mut self, intent: IntentEvent, now_ms: i64) {
        for attempt in 1..=APPEND_ATTEMPTS {
            match self
                .producer
                .append(&self.symbol, Some(&intent.dedupe_key), now_ms, &intent)
                .await
            {
                Ok(AppendOutcome::Appended { entry_id }) => {
                    info!(
                        symbol = %self.symbol,
                        action = %intent.action,
                        direction = %intent.direction,
                        price = %intent.reference_price,
                        entry_id,
                        "intent published"
                    );
                    self.cooldowns.install_pending(
                        intent,
                        now_ms,
                        self.cfg.intent_pending_timeout_ms(),
                    );
                    return;
                }
                Ok(AppendOutcome::Duplicate { original }) => {
                    // An identical decision is already on the stream; track
                    // the original so its fill resolves our pending slot.
                    debug!(
                        symbol = %self.symbol,
                        action = %original.action,
                        "duplicate intent swallowed, tracking original"
                    );
                    self.cooldowns.install_pending(
                        original,
                        now_ms,
                        self.cfg.intent_pending_timeout_ms(),
                    );
                    return;
                }
                Err(e) if attempt < APPEND_ATTEMPTS => {
                    warn!(symbol = %self.symbol, attempt, "intent append failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    // Give up for this tick; the evaluator will re-propose.
                    error!(symbol = %self.symbol, "intent append abandoned: {e:#}");
                    return;
                }
            }
        }
    }

    /// Apply one reconciled fill to the book.
    pub async fn apply_fill(&mut self, fill: FillEvent) {
        if !self.applied_fills.insert(fill.event_id) {
            debug!(symbol = %self.symbol, fill_id = %fill.event_id, "fill already applied, ignored");
            return;
        }

        let resolved = self.cooldowns.resolve_pending(fill.intent_id);
        if !resolved {
            debug!(
                symbol = %self.symbol,
                intent_id = %fill.intent_id,
                "fill for an intent no longer pending (timed out or restored)"
            );
        }

        if fill.status == FillStatus::Rejected {
            info!(
                symbol = %self.symbol,
                action = %fill.action,
                intent_id = %fill.intent_id,
                "broker rejected intent, book untouched"
            );
            return;
        }

        match fill.action.clone() {
            action if action.is_entry() => self.apply_entry_fill(&fill).await,
            IntentAction::StopLoss { target_lot } | IntentAction::TakeProfit { target_lot } => {
                let target = fill.lot_id.unwrap_or(target_lot);
                match self.book.close_by_id(target) {
                    Ok(lot) => info!(
                        symbol = %self.symbol,
                        action = %fill.action,
                        lot_id = %lot.lot_id,
                        entry = %lot.entry_price,
                        exit = %fill.fill_price,
                        "lot closed"
                    ),
                    Err(e) => self.quarantine_fill(&fill, &e.to_string()).await,
                }
            }
            IntentAction::ScaleOut { .. } => {
                match self.book.close_newest() {
                    Some(lot) => {
                        self.cooldowns
                            .arm_scale_out(fill.ts_ms, self.cfg.scaleout_cooldown_ms());
                        info!(symbol = %self.symbol, lot_id = %lot.lot_id, "scaled out of newest lot");
                    }
                    None => self.quarantine_fill(&fill, "scale-out fill on empty book").await,
                }
            }
            IntentAction::NearTouch { .. } | IntentAction::InitOut { .. } => {
                match self.book.close_newest() {
                    Some(lot) => info!(
                        symbol = %self.symbol,
                        action = %fill.action,
                        lot_id = %lot.lot_id,
                        "newest lot closed"
                    ),
                    None => self.quarantine_fill(&fill, "exit fill on empty book").await,
                }
            }
            IntentAction::NormalExit { target_lots } | IntentAction::RiskControl { target_lots } => {
                let mut closed = 0usize;
                for lot_id in target_lots {
                    match self.book.close_by_id(lot_id) {
                        Ok(_) => closed += 1,
                        Err(e) => warn!(symbol = %self.symbol, "{e}"),
                    }
                }
                if closed == 0 {
                    self.quarantine_fill(&fill, "exit fill matched no lots").await;
                } else {
                    info!(
                        symbol = %self.symbol,
                        action = %fill.action,
                        closed,
                        remaining = self.book.len(),
                        "lots closed"
                    );
                }
            }
            _ => unreachable!("entry actions handled above"),
        }
    }

    async fn apply_entry_fill(&mut self, fill: &FillEvent) {
        let Some(stage) = fill.action.entry_stage() else {
            return;
        };
        let lot = evaluator::lot_from_entry_fill(
            &self.symbol,
            fill.direction,
            stage,
            fill.lot_id.unwrap_or_else(Uuid::new_v4),
            fill.fill_price,
            fill.filled_size,
            fill.ts_ms,
            fill.ma_thr_at_entry,
        );
        let lot_id = lot.lot_id;

        match self.book.append(lot) {
            Ok(()) => {
                if matches!(fill.action, IntentAction::ScaleIn { .. }) {
                    self.cooldowns
                        .arm_scale_in(fill.ts_ms, self.cfg.scale_in_cooldown_ms());
                }
                info!(
                    symbol = %self.symbol,
                    stage = %stage,
                    lot_id = %lot_id,
                    price = %fill.fill_price,
                    book_size = self.book.len(),
                    "lot opened"
                );
            }
            Err(e) => self.quarantine_fill(fill, &e.to_string()).await,
        }
    }

    async fn quarantine_fill(&self, fill: &FillEvent, reason: &str) {
        if let Err(e) = self
            .quarantine
            .quarantine(fill, reason, fill.ts_ms)
            .await
        {
            error!(symbol = %self.symbol, "failed to persist quarantined fill: {e:#}");
        }
    }

    pub async fn snapshot(&self, now_ms: i64) {
        let snapshot = SymbolSnapshot {
            symbol: self.symbol.clone(),
            book: self.book.clone(),
            closes: self.indicators.closes(),
            cooldowns: self.cooldowns.clone(),
            current_bucket_start_ms: self.aggregator.current_bucket_start_ms(),
            last_close: self.indicators.last_close(),
            taken_ts_ms: now_ms,
        };
        if let Err(e) = self.snapshots.save(&snapshot).await {
            error!(symbol = %self.symbol, "snapshot failed: {e:#}");
        } else {
            debug!(symbol = %self.symbol, "snapshot taken");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Direction;
    use crate::infrastructure::bus::SIGNAL_STREAM;
    use crate::infrastructure::persistence::database::Database;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const MIN_MS: i64 = 60_000;

    struct Fixture {
        db: Database,
        lane: SymbolLane,
    }

    async fn fixture(snapshot: Option<SymbolSnapshot>) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let producer = Arc::new(StreamProducer::new(db.pool.clone(), SIGNAL_STREAM));
        let snapshots = Arc::new(SnapshotStore::new(db.pool.clone()));
        let quarantine = Arc::new(QuarantineStore::new(db.pool.clone()));
        let lane = SymbolLane::new(
            "USDJPY",
            StrategyConfig::default(),
            producer,
            snapshots,
            quarantine,
            snapshot,
        );
        Fixture { db, lane }
    }

    fn tick(price: Decimal, ts_ms: i64) -> Tick {
        Tick {
            symbol: "USDJPY".to_string(),
            price,
            ts_ms,
        }
    }

    /// Drive 101 flat candles so ma and momentum are both defined.
    async fn warm_up(lane: &mut SymbolLane, price: Decimal) -> i64 {
        let mut ts = 0;
        for _ in 0..=101 {
            lane.on_tick(tick(price, ts)).await;
            ts += MIN_MS;
        }
        ts
    }

    async fn signal_count(db: &Database) -> i64 {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM stream_events WHERE stream = 'signals'")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        row.0
    }

    async fn latest_intent(db: &Database) -> IntentEvent {
        let row: (String,) = sqlx::query_as(
            "SELECT payload FROM stream_events WHERE stream = 'signals' ORDER BY id DESC LIMIT 1",
        )
        .fetch_one(&db.pool)
        .await
        .unwrap();
        serde_json::from_str(&row.0).unwrap()
    }

    fn fill_for(intent: &IntentEvent, price: Decimal, ts_ms: i64) -> FillEvent {
        FillEvent {
            event_id: Uuid::new_v4(),
            intent_id: intent.event_id,
            symbol: intent.symbol.clone(),
            action: intent.action.clone(),
            direction: intent.direction,
            lot_id: intent.action.is_entry().then(Uuid::new_v4),
            fill_price: price,
            filled_size: intent.size,
            ts_ms,
            status: FillStatus::Filled,
            ma_thr_at_entry: intent.ma_thr_at_entry,
        }
    }

    #[tokio::test]
    async fn test_no_intents_during_warm_up() {
        let mut f = fixture(None).await;
        // 50 candles of a deep dip: ma is still undefined, so nothing fires.
        let mut ts = 0;
        for _ in 0..50 {
            f.lane.on_tick(tick(dec!(90), ts)).await;
            ts += MIN_MS;
        }
        assert_eq!(signal_count(&f.db).await, 0);
    }

    #[tokio::test]
    async fn test_init_fires_once_then_pending_blocks() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;

        // Price gaps below the band; the synthetic flat candles keep ma at
        // 100 while momentum turns negative once the dip candle closes.
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        f.lane.on_tick(tick(dec!(98.8), ts + MIN_MS + 1_000)).await;

        let published = signal_count(&f.db).await;
        assert_eq!(published, 1, "pending intent must suppress re-emission");
        let intent = latest_intent(&f.db).await;
        assert_eq!(intent.action, IntentAction::Init);
        assert_eq!(intent.direction, Direction::Long);
    }

    #[tokio::test]
    async fn test_entry_fill_opens_lot_and_resolves_pending() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        let intent = latest_intent(&f.db).await;

        f.lane
            .apply_fill(fill_for(&intent, dec!(98.9), ts + MIN_MS + 500))
            .await;

        assert_eq!(f.lane.book().len(), 1);
        let lot = f.lane.book().oldest().unwrap();
        assert_eq!(lot.entry_price, dec!(98.9));
        assert_eq!(lot.ma_thr_at_entry, intent.ma_thr_at_entry);
        assert!(f.lane.cooldowns().pending(ts + MIN_MS + 600).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_fill_delivery_is_noop() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        let intent = latest_intent(&f.db).await;

        let fill = fill_for(&intent, dec!(98.9), ts + 2 * MIN_MS);
        f.lane.apply_fill(fill.clone()).await;
        f.lane.apply_fill(fill).await;

        assert_eq!(f.lane.book().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_fill_clears_pending_without_mutation() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        let intent = latest_intent(&f.db).await;

        let mut fill = fill_for(&intent, dec!(98.9), ts + 2 * MIN_MS);
        fill.status = FillStatus::Rejected;
        fill.lot_id = None;
        f.lane.apply_fill(fill).await;

        assert!(f.lane.book().is_empty());
        assert!(f.lane.cooldowns().pending(ts + 2 * MIN_MS + 1).is_none());
    }

    #[tokio::test]
    async fn test_direction_conflict_fill_quarantined() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        let intent = latest_intent(&f.db).await;
        f.lane
            .apply_fill(fill_for(&intent, dec!(98.9), ts + 2 * MIN_MS))
            .await;

        // A rogue SHORT entry fill against the LONG book.
        let mut rogue = fill_for(&intent, dec!(99.1), ts + 3 * MIN_MS);
        rogue.event_id = Uuid::new_v4();
        rogue.intent_id = Uuid::new_v4();
        rogue.direction = Direction::Short;
        f.lane.apply_fill(rogue).await;

        assert_eq!(f.lane.book().len(), 1);
        let quarantine = QuarantineStore::new(f.db.pool.clone());
        assert_eq!(quarantine.count("USDJPY").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scale_in_fill_arms_cooldown() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        let init = latest_intent(&f.db).await;
        f.lane
            .apply_fill(fill_for(&init, dec!(98.9), ts + MIN_MS + 500))
            .await;

        // Ten minutes on, the price steps down across a candle close so
        // momentum turns negative again: SCALE_IN.
        let t2 = ts + 11 * MIN_MS;
        f.lane.on_tick(tick(dec!(98.4), t2)).await;
        f.lane.on_tick(tick(dec!(98.4), t2 + MIN_MS)).await;
        let scale = latest_intent(&f.db).await;
        assert!(matches!(scale.action, IntentAction::ScaleIn { .. }));
        f.lane
            .apply_fill(fill_for(&scale, dec!(98.4), t2 + MIN_MS + 500))
            .await;

        assert_eq!(f.lane.book().len(), 2);
        assert!(f.lane.cooldowns().scale_in_active(t2 + 2 * MIN_MS));

        // A second leg down 15 minutes later satisfies every scale-in guard,
        // but the cooldown is still armed: nothing new is published.
        let t3 = t2 + 16 * MIN_MS;
        f.lane.on_tick(tick(dec!(97.9), t3)).await;
        f.lane.on_tick(tick(dec!(97.9), t3 + MIN_MS)).await;
        let count = signal_count(&f.db).await;
        assert_eq!(count, 2, "scale-in cooldown must suppress a third intent");
    }

    #[tokio::test]
    async fn test_pending_timeout_frees_evaluator() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        assert_eq!(signal_count(&f.db).await, 1);

        // No fill ever arrives. Past the timeout (and the dedupe window) a
        // fresh downswing makes the evaluator propose again.
        let later = ts + 7 * MIN_MS;
        f.lane.on_tick(tick(dec!(98.5), later)).await;
        f.lane.on_tick(tick(dec!(98.5), later + MIN_MS)).await;
        assert_eq!(signal_count(&f.db).await, 2);
    }

    #[tokio::test]
    async fn test_normal_exit_fill_flattens_book() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        let init = latest_intent(&f.db).await;
        f.lane
            .apply_fill(fill_for(&init, dec!(98.9), ts + MIN_MS + 500))
            .await;

        // Rally through the upper band. TP on the oldest lot stays quiet
        // because the lot entered at 98.9 and 3% away is 101.867.
        let t2 = ts + 20 * MIN_MS;
        f.lane.on_tick(tick(dec!(101.2), t2)).await;
        let exit = latest_intent(&f.db).await;
        assert!(matches!(exit.action, IntentAction::NormalExit { .. }));

        f.lane.apply_fill(fill_for(&exit, dec!(101.2), t2 + 500)).await;
        assert!(f.lane.book().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_restore_resumes_book_and_cooldowns() {
        let mut f = fixture(None).await;
        let ts = warm_up(&mut f.lane, dec!(100)).await;
        f.lane.on_tick(tick(dec!(98.9), ts)).await;
        f.lane.on_tick(tick(dec!(98.9), ts + MIN_MS)).await;
        let init = latest_intent(&f.db).await;
        f.lane
            .apply_fill(fill_for(&init, dec!(98.9), ts + MIN_MS + 500))
            .await;
        f.lane.snapshot(ts + 2 * MIN_MS).await;

        let store = SnapshotStore::new(f.db.pool.clone());
        let snap = store.load("USDJPY").await.unwrap().unwrap();
        let restored = fixture(Some(snap)).await;
        assert_eq!(restored.lane.book().len(), 1);
        assert_eq!(
            restored.lane.book().oldest().unwrap().entry_price,
            dec!(98.9)
        );
        assert!(restored.lane.cooldowns().pending(ts + 2 * MIN_MS).is_none());
    }
}
