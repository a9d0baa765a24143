//! The strategy decision engine.
//!
//! [`evaluate`] is a pure function from market state, position book and
//! cooldowns to at most one decision. Rules are checked in a fixed priority
//! order and the first matching guard wins: exits dominate entries, per-lot
//! mechanical stops dominate structural exits, and risk-reduction dominates
//! risk-addition. Callers enforce the preconditions (warm indicators, no
//! pending intent) before calling in.

use crate::config::StrategyConfig;
use crate::domain::book::PositionBook;
use crate::domain::types::{Direction, EntryStage, IntentAction, IntentEvent, Lot, dedupe_key};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

/// Everything one evaluation reads. `price` is the live tick price; `ma` and
/// `momentum` refresh on candle close.
pub struct EvalContext<'a> {
    pub price: Decimal,
    pub ma: Decimal,
    pub momentum: Decimal,
    pub book: &'a PositionBook,
    pub scale_in_blocked: bool,
    pub scale_out_blocked: bool,
    pub cfg: &'a StrategyConfig,
    pub now_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: IntentAction,
    pub direction: Direction,
}

impl Decision {
    /// Materialise the decision as a bus event. The current `ma_thr_eff` is
    /// frozen onto the intent here; lots created from its fill keep it for
    /// the rest of their life.
    pub fn into_intent(
        self,
        symbol: &str,
        reference_price: Decimal,
        book_len: usize,
        now_ms: i64,
        cfg: &StrategyConfig,
    ) -> IntentEvent {
        let reference_lot = self.action.target_lots().first().copied();
        let key = dedupe_key(symbol, &self.action, book_len, now_ms, reference_lot);
        IntentEvent {
            event_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action: self.action,
            direction: self.direction,
            reference_price,
            ts_ms: now_ms,
            size: cfg.order_size,
            ma_thr_at_entry: cfg.ma_thr_eff,
            dedupe_key: key,
        }
    }
}

/// SL/TP width multiplier by lot age. Lower bounds are half-open: an age of
/// exactly one hour already reads the second row.
pub fn age_factor(age_ms: i64) -> Decimal {
    const HOUR_MS: i64 = 3_600_000;
    if age_ms < HOUR_MS {
        dec!(3.0)
    } else if age_ms < 2 * HOUR_MS {
        dec!(2.5)
    } else if age_ms < 12 * HOUR_MS {
        dec!(2.0)
    } else if age_ms < 24 * HOUR_MS {
        dec!(1.5)
    } else {
        dec!(1.0)
    }
}

pub fn evaluate(ctx: &EvalContext<'_>) -> Option<Decision> {
    check_stop_loss(ctx)
        .or_else(|| check_take_profit(ctx))
        .or_else(|| check_normal_exit(ctx))
        .or_else(|| check_risk_control(ctx))
        .or_else(|| check_near_touch(ctx))
        .or_else(|| check_scale_out(ctx))
        .or_else(|| check_init_out(ctx))
        .or_else(|| check_scale_in(ctx))
        .or_else(|| check_init_ladder(ctx))
        .or_else(|| check_init(ctx))
}

fn check_stop_loss(ctx: &EvalContext<'_>) -> Option<Decision> {
    let oldest = ctx.book.oldest()?;
    let sl_pct = oldest.ma_thr_at_entry * age_factor(oldest.age_ms(ctx.now_ms));
    let triggered = match oldest.direction {
        Direction::Long => ctx.price <= oldest.entry_price * (Decimal::ONE - sl_pct),
        Direction::Short => ctx.price >= oldest.entry_price * (Decimal::ONE + sl_pct),
    };
    triggered.then(|| Decision {
        action: IntentAction::StopLoss {
            target_lot: oldest.lot_id,
        },
        direction: oldest.direction,
    })
}

fn check_take_profit(ctx: &EvalContext<'_>) -> Option<Decision> {
    let oldest = ctx.book.oldest()?;
    let tp_pct = oldest.ma_thr_at_entry * age_factor(oldest.age_ms(ctx.now_ms));
    let triggered = match oldest.direction {
        Direction::Long => ctx.price >= oldest.entry_price * (Decimal::ONE + tp_pct),
        Direction::Short => ctx.price <= oldest.entry_price * (Decimal::ONE - tp_pct),
    };
    triggered.then(|| Decision {
        action: IntentAction::TakeProfit {
            target_lot: oldest.lot_id,
        },
        direction: oldest.direction,
    })
}

fn check_normal_exit(ctx: &EvalContext<'_>) -> Option<Decision> {
    let direction = ctx.book.direction()?;
    let triggered = match direction {
        Direction::Long => ctx.price >= ctx.ma * (Decimal::ONE + ctx.cfg.ma_thr_eff),
        Direction::Short => ctx.price <= ctx.ma * (Decimal::ONE - ctx.cfg.ma_thr_eff),
    };
    triggered.then(|| Decision {
        action: IntentAction::NormalExit {
            target_lots: ctx.book.lot_ids(),
        },
        direction,
    })
}

fn check_risk_control(ctx: &EvalContext<'_>) -> Option<Decision> {
    let len = ctx.book.len();
    if len != 3 && len != 4 {
        return None;
    }
    let direction = ctx.book.direction()?;
    let avg = ctx.book.avg_entry_price()?;
    let favourable = match direction {
        Direction::Long => ctx.price >= avg * (Decimal::ONE + ctx.cfg.risk_control_threshold),
        Direction::Short => ctx.price <= avg * (Decimal::ONE - ctx.cfg.risk_control_threshold),
    };
    if !favourable {
        return None;
    }
    let target_lots = if len == 3 {
        vec![ctx.book.oldest()?.lot_id]
    } else {
        ctx.book.lot_ids()
    };
    Some(Decision {
        action: IntentAction::RiskControl { target_lots },
        direction,
    })
}

fn check_near_touch(ctx: &EvalContext<'_>) -> Option<Decision> {
    let newest = ctx.book.newest()?;
    if newest.age_ms(ctx.now_ms) > ctx.cfg.near_touch_window_ms() {
        return None;
    }
    let distance = (ctx.price - ctx.ma).abs();
    let triggered = distance <= ctx.cfg.near_touch_eps * ctx.ma;
    triggered.then(|| Decision {
        action: IntentAction::NearTouch {
            target_lot: newest.lot_id,
        },
        direction: newest.direction,
    })
}

fn check_scale_out(ctx: &EvalContext<'_>) -> Option<Decision> {
    if ctx.scale_out_blocked {
        return None;
    }
    let newest = ctx.book.newest()?;
    let prev_entry = ctx.book.prev_entry_price()?;
    let half_thr = ctx.cfg.ma_thr_eff / dec!(2);
    // Deliberately no momentum gate here.
    let triggered = match newest.direction {
        Direction::Long => {
            ctx.price >= prev_entry && ctx.price >= ctx.ma * (Decimal::ONE + half_thr)
        }
        Direction::Short => {
            ctx.price <= prev_entry && ctx.price <= ctx.ma * (Decimal::ONE - half_thr)
        }
    };
    triggered.then(|| Decision {
        action: IntentAction::ScaleOut {
            target_lot: newest.lot_id,
        },
        direction: newest.direction,
    })
}

fn check_init_out(ctx: &EvalContext<'_>) -> Option<Decision> {
    if ctx.book.len() != 1 {
        return None;
    }
    let lot = ctx.book.oldest()?;
    let half_thr = ctx.cfg.ma_thr_eff / dec!(2);
    let triggered = match lot.direction {
        Direction::Long => {
            ctx.price >= ctx.ma * (Decimal::ONE + half_thr)
                && ctx.momentum >= ctx.cfg.momentum_threshold
        }
        Direction::Short => {
            ctx.price <= ctx.ma * (Decimal::ONE - half_thr)
                && -ctx.momentum >= ctx.cfg.momentum_threshold
        }
    };
    triggered.then(|| Decision {
        action: IntentAction::InitOut {
            target_lot: lot.lot_id,
        },
        direction: lot.direction,
    })
}

fn check_scale_in(ctx: &EvalContext<'_>) -> Option<Decision> {
    if ctx.scale_in_blocked || ctx.book.is_empty() || ctx.book.len() >= ctx.cfg.max_lots {
        return None;
    }
    let newest = ctx.book.newest()?;
    let half_thr = ctx.cfg.ma_thr_eff / dec!(2);
    let triggered = match newest.direction {
        Direction::Long => {
            ctx.price < newest.entry_price
                && -ctx.momentum >= ctx.cfg.momentum_threshold
                && ctx.price <= ctx.ma * (Decimal::ONE - half_thr)
        }
        Direction::Short => {
            ctx.price > newest.entry_price
                && ctx.momentum >= ctx.cfg.momentum_threshold
                && ctx.price >= ctx.ma * (Decimal::ONE + half_thr)
        }
    };
    let ordinal = ctx
        .book
        .lots()
        .filter(|l| matches!(l.stage, EntryStage::ScaleIn(_)))
        .count() as u8
        + 1;
    triggered.then(|| Decision {
        action: IntentAction::ScaleIn { ordinal },
        direction: newest.direction,
    })
}

/// INIT2 fires only on a book of exactly `[INIT]`, INIT3 only on exactly
/// `[INIT, INIT2]`; a scale-in in between retires the ladder. Ladder prices
/// step off the INIT lot's entry, one `ma_thr_eff` per rung.
fn check_init_ladder(ctx: &EvalContext<'_>) -> Option<Decision> {
    let init = ctx.book.oldest()?;
    if init.stage != EntryStage::Init || init.age_ms(ctx.now_ms) > ctx.cfg.init_window_ms() {
        return None;
    }

    let (next_stage, rungs) = match ctx.book.len() {
        1 => (IntentAction::Init2, dec!(1)),
        2 if ctx.book.newest().is_some_and(|l| l.stage == EntryStage::Init2) => {
            (IntentAction::Init3, dec!(2))
        }
        _ => return None,
    };

    let step = ctx.cfg.ma_thr_eff * rungs;
    let triggered = match init.direction {
        Direction::Long => ctx.price <= init.entry_price * (Decimal::ONE - step),
        Direction::Short => ctx.price >= init.entry_price * (Decimal::ONE + step),
    };
    triggered.then(|| Decision {
        action: next_stage,
        direction: init.direction,
    })
}

fn check_init(ctx: &EvalContext<'_>) -> Option<Decision> {
    if !ctx.book.is_empty() {
        return None;
    }
    let thr = ctx.cfg.ma_thr_eff;
    if ctx.price <= ctx.ma * (Decimal::ONE - thr) && -ctx.momentum >= ctx.cfg.momentum_threshold {
        return Some(Decision {
            action: IntentAction::Init,
            direction: Direction::Long,
        });
    }
    if ctx.price >= ctx.ma * (Decimal::ONE + thr) && ctx.momentum >= ctx.cfg.momentum_threshold {
        return Some(Decision {
            action: IntentAction::Init,
            direction: Direction::Short,
        });
    }
    None
}

/// Convenience for the reconciler: the lot a fresh entry fill creates.
pub fn lot_from_entry_fill(
    symbol: &str,
    direction: Direction,
    stage: EntryStage,
    lot_id: Uuid,
    fill_price: Decimal,
    filled_size: Decimal,
    fill_ts_ms: i64,
    ma_thr_at_entry: Decimal,
) -> Lot {
    Lot {
        lot_id,
        symbol: symbol.to_string(),
        direction,
        entry_price: fill_price,
        entry_ts_ms: fill_ts_ms,
        size: filled_size,
        stage,
        ma_thr_at_entry,
    }
}
