use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// A single market data point pushed by the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub ts_ms: i64,
}

/// One closed (or open) 1-minute OHLC bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub bucket_start_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub n_ticks: u32,
}

/// Which step of the entry ladder created a lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStage {
    Init,
    Init2,
    Init3,
    /// k-th scale-in, counted from 1.
    ScaleIn(u8),
}

impl fmt::Display for EntryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStage::Init => write!(f, "INIT"),
            EntryStage::Init2 => write!(f, "INIT2"),
            EntryStage::Init3 => write!(f, "INIT3"),
            EntryStage::ScaleIn(k) => write!(f, "SCALE_IN_{}", k),
        }
    }
}

/// A filled position within the book. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub lot_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub entry_ts_ms: i64,
    pub size: Decimal,
    pub stage: EntryStage,
    /// MA deviation threshold frozen at intent emission. SL/TP widths are
    /// computed from this value, not from the live configuration.
    pub ma_thr_at_entry: Decimal,
}

impl Lot {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.entry_ts_ms
    }
}

/// The decision taken by the evaluator, with per-variant targets.
///
/// Exit variants name the lots they close so executors and the reconciler
/// never have to re-derive them from a book that may have moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentAction {
    Init,
    Init2,
    Init3,
    ScaleIn { ordinal: u8 },
    StopLoss { target_lot: Uuid },
    TakeProfit { target_lot: Uuid },
    NormalExit { target_lots: Vec<Uuid> },
    RiskControl { target_lots: Vec<Uuid> },
    ScaleOut { target_lot: Uuid },
    InitOut { target_lot: Uuid },
    NearTouch { target_lot: Uuid },
}

impl IntentAction {
    /// Stable wire name, also used in dedupe fingerprints.
    pub fn kind(&self) -> &'static str {
        match self {
            IntentAction::Init => "INIT",
            IntentAction::Init2 => "INIT2",
            IntentAction::Init3 => "INIT3",
            IntentAction::ScaleIn { .. } => "SCALE_IN",
            IntentAction::StopLoss { .. } => "STOP_LOSS",
            IntentAction::TakeProfit { .. } => "TAKE_PROFIT",
            IntentAction::NormalExit { .. } => "NORMAL_EXIT",
            IntentAction::RiskControl { .. } => "RISK_CONTROL",
            IntentAction::ScaleOut { .. } => "SCALE_OUT",
            IntentAction::InitOut { .. } => "INIT_OUT",
            IntentAction::NearTouch { .. } => "NEAR_TOUCH",
        }
    }

    /// True for actions that open a new lot when filled.
    pub fn is_entry(&self) -> bool {
        matches!(
            self,
            IntentAction::Init
                | IntentAction::Init2
                | IntentAction::Init3
                | IntentAction::ScaleIn { .. }
        )
    }

    /// The stage label a fill of this action stamps onto the new lot.
    pub fn entry_stage(&self) -> Option<EntryStage> {
        match self {
            IntentAction::Init => Some(EntryStage::Init),
            IntentAction::Init2 => Some(EntryStage::Init2),
            IntentAction::Init3 => Some(EntryStage::Init3),
            IntentAction::ScaleIn { ordinal } => Some(EntryStage::ScaleIn(*ordinal)),
            _ => None,
        }
    }

    /// Lots an exit variant targets, oldest first. Empty for entries.
    pub fn target_lots(&self) -> Vec<Uuid> {
        match self {
            IntentAction::StopLoss { target_lot }
            | IntentAction::TakeProfit { target_lot }
            | IntentAction::ScaleOut { target_lot }
            | IntentAction::InitOut { target_lot }
            | IntentAction::NearTouch { target_lot } => vec![*target_lot],
            IntentAction::NormalExit { target_lots } | IntentAction::RiskControl { target_lots } => {
                target_lots.clone()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for IntentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Published on the signal stream; one per accepted strategy decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentEvent {
    pub event_id: Uuid,
    pub symbol: String,
    pub action: IntentAction,
    pub direction: Direction,
    pub reference_price: Decimal,
    pub ts_ms: i64,
    /// Requested size for entry actions; exits close whole lots.
    pub size: Decimal,
    /// `ma_thr_eff` at emission time; copied onto the lot when the fill lands.
    pub ma_thr_at_entry: Decimal,
    pub dedupe_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillStatus {
    Filled,
    Partial,
    Rejected,
}

impl fmt::Display for FillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Published on the fill stream by executors; one per broker outcome.
///
/// Echoes the originating action so the reconciler can apply the book
/// mutation without a lookup, even for fills that outlive their pending
/// intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub event_id: Uuid,
    pub intent_id: Uuid,
    pub symbol: String,
    pub action: IntentAction,
    pub direction: Direction,
    /// Minted by the executor for entry fills; the targeted lot for
    /// single-lot exits; absent for multi-lot exits and rejections.
    pub lot_id: Option<Uuid>,
    pub fill_price: Decimal,
    pub filled_size: Decimal,
    pub ts_ms: i64,
    pub status: FillStatus,
    pub ma_thr_at_entry: Decimal,
}

/// Fingerprint of a logical decision: same symbol, action kind, book size,
/// minute and reference lot hash to the same key, so a re-evaluation inside
/// the dedupe window cannot produce a second order.
pub fn dedupe_key(
    symbol: &str,
    action: &IntentAction,
    book_len: usize,
    now_ms: i64,
    reference_lot: Option<Uuid>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(action.kind().as_bytes());
    hasher.update(book_len.to_le_bytes());
    hasher.update((now_ms / 60_000).to_le_bytes());
    if let Some(lot) = reference_lot {
        hasher.update(lot.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}
