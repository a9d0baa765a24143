use crate::domain::types::{Candle, Tick};
use rust_decimal::Decimal;
use tracing::debug;

#[derive(Debug, Clone)]
struct CandleBuilder {
    bucket_start_ms: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    n_ticks: u32,
}

impl CandleBuilder {
    fn new(bucket_start_ms: i64, price: Decimal) -> Self {
        Self {
            bucket_start_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            n_ticks: 1,
        }
    }

    fn update(&mut self, price: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.n_ticks += 1;
    }

    fn build(&self, symbol: &str) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            bucket_start_ms: self.bucket_start_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            n_ticks: self.n_ticks,
        }
    }
}

/// Folds one symbol's ticks into fixed-period OHLC candles.
///
/// A bucket closes as soon as a tick lands at or past its end. Minutes with
/// no ticks at all are synthesised as flat candles at the previous close so
/// the indicator ring never skips a slot.
pub struct CandleAggregator {
    symbol: String,
    period_ms: i64,
    current: Option<CandleBuilder>,
}

impl CandleAggregator {
    pub fn new(symbol: impl Into<String>, period_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            period_ms,
            current: None,
        }
    }

    /// Resume after a restart: only the bucket boundary matters, intra-bucket
    /// state is rebuilt from the next tick.
    pub fn restore_bucket(&mut self, bucket_start_ms: i64, last_close: Decimal) {
        self.current = Some(CandleBuilder::new(bucket_start_ms, last_close));
    }

    pub fn current_bucket_start_ms(&self) -> Option<i64> {
        self.current.as_ref().map(|b| b.bucket_start_ms)
    }

    fn bucket_of(&self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.period_ms)
    }

    /// Fold one tick. Returns the candles this tick closed, oldest first:
    /// empty while the bucket is still open, one candle on a normal rollover,
    /// more when whole minutes were skipped.
    pub fn on_tick(&mut self, tick: &Tick) -> Vec<Candle> {
        let bucket = self.bucket_of(tick.ts_ms);

        let Some(builder) = self.current.as_mut() else {
            debug!(symbol = %self.symbol, price = %tick.price, "first tick, opening candle");
            self.current = Some(CandleBuilder::new(bucket, tick.price));
            return Vec::new();
        };

        if bucket <= builder.bucket_start_ms {
            builder.update(tick.price);
            return Vec::new();
        }

        let mut closed = vec![builder.build(&self.symbol)];
        let prev_close = builder.close;

        // Flat candles for every fully skipped bucket.
        let mut cursor = builder.bucket_start_ms + self.period_ms;
        while cursor < bucket {
            closed.push(Candle {
                symbol: self.symbol.clone(),
                bucket_start_ms: cursor,
                open: prev_close,
                high: prev_close,
                low: prev_close,
                close: prev_close,
                n_ticks: 0,
            });
            cursor += self.period_ms;
        }

        self.current = Some(CandleBuilder::new(bucket, tick.price));
        closed
    }
}
