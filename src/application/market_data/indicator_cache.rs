use crate::domain::types::Candle;
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Incremental MA and momentum over the last `ma_period` closed candles of
/// one symbol.
///
/// `ma` stays undefined until the ring is full, which suppresses every entry
/// decision during warm-up. `momentum` is the signed fractional change
/// against the close `momentum_window` candles back and needs
/// `momentum_window + 1` closes.
pub struct IndicatorCache {
    ma_period: usize,
    momentum_window: usize,
    closes: VecDeque<Decimal>,
    running_sum: Decimal,
}

impl IndicatorCache {
    pub fn new(ma_period: usize, momentum_window: usize) -> Self {
        Self {
            ma_period,
            momentum_window,
            closes: VecDeque::with_capacity(ma_period + 1),
            running_sum: Decimal::ZERO,
        }
    }

    /// Rebuild from a snapshot's close history, oldest first.
    pub fn from_closes(ma_period: usize, momentum_window: usize, closes: Vec<Decimal>) -> Self {
        let mut cache = Self::new(ma_period, momentum_window);
        for close in closes {
            cache.push_close(close);
        }
        cache
    }

    pub fn closes(&self) -> Vec<Decimal> {
        self.closes.iter().copied().collect()
    }

    pub fn on_close(&mut self, candle: &Candle) {
        self.push_close(candle.close);
    }

    fn push_close(&mut self, close: Decimal) {
        self.closes.push_back(close);
        self.running_sum += close;
        if self.closes.len() > self.ma_period {
            let dropped = self.closes.pop_front().expect("ring not empty");
            self.running_sum -= dropped;
        }
    }

    /// Arithmetic mean of the ring; None until `ma_period` closes accumulated.
    pub fn ma(&self) -> Option<Decimal> {
        if self.closes.len() < self.ma_period {
            return None;
        }
        Some(self.running_sum / Decimal::from(self.ma_period))
    }

    /// `(close[t] - close[t-w]) / close[t-w]`; None until w+1 closes exist.
    pub fn momentum(&self) -> Option<Decimal> {
        let len = self.closes.len();
        if len < self.momentum_window + 1 {
            return None;
        }
        let latest = *self.closes.back()?;
        let reference = self.closes[len - 1 - self.momentum_window];
        if reference.is_zero() {
            return None;
        }
        Some((latest - reference) / reference)
    }

    /// Close of the most recently completed candle.
    pub fn last_close(&self) -> Option<Decimal> {
        self.closes.back().copied()
    }

    pub fn is_warm(&self) -> bool {
        self.ma().is_some() && self.momentum().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(close: Decimal, bucket_start_ms: i64) -> Candle {
        Candle {
            symbol: "USDJPY".to_string(),
            bucket_start_ms,
            open: close,
            high: close,
            low: close,
            close,
            n_ticks: 1,
        }
    }

    #[test]
    fn test_ma_undefined_until_ring_full() {
        let mut cache = IndicatorCache::new(100, 3);
        for i in 0..99 {
            cache.on_close(&candle(dec!(100), i * 60_000));
        }
        assert!(cache.ma().is_none());
        assert!(!cache.is_warm());

        cache.on_close(&candle(dec!(100), 99 * 60_000));
        assert_eq!(cache.ma().unwrap(), dec!(100));
        assert!(cache.is_warm());
    }

    #[test]
    fn test_ma_is_mean_of_last_period_closes() {
        let mut cache = IndicatorCache::new(4, 3);
        for close in [dec!(1), dec!(2), dec!(3), dec!(4)] {
            cache.on_close(&candle(close, 0));
        }
        assert_eq!(cache.ma().unwrap(), dec!(2.5));

        // Oldest close (1) drops out of the ring.
        cache.on_close(&candle(dec!(5), 0));
        assert_eq!(cache.ma().unwrap(), dec!(3.5));
    }

    #[test]
    fn test_momentum_needs_window_plus_one() {
        let mut cache = IndicatorCache::new(100, 3);
        for close in [dec!(100), dec!(101), dec!(102)] {
            cache.on_close(&candle(close, 0));
        }
        assert!(cache.momentum().is_none());

        cache.on_close(&candle(dec!(104), 0));
        // (104 - 100) / 100
        assert_eq!(cache.momentum().unwrap(), dec!(0.04));
    }

    #[test]
    fn test_momentum_is_signed() {
        let mut cache = IndicatorCache::new(100, 3);
        for close in [dec!(100), dec!(100), dec!(100), dec!(99.6)] {
            cache.on_close(&candle(close, 0));
        }
        assert_eq!(cache.momentum().unwrap(), dec!(-0.004));
    }

    #[test]
    fn test_from_closes_round_trip() {
        let mut cache = IndicatorCache::new(4, 3);
        for close in [dec!(1), dec!(2), dec!(3), dec!(4), dec!(5)] {
            cache.on_close(&candle(close, 0));
        }

        let restored = IndicatorCache::from_closes(4, 3, cache.closes());
        assert_eq!(restored.ma(), cache.ma());
        assert_eq!(restored.momentum(), cache.momentum());
        assert_eq!(restored.last_close(), Some(dec!(5)));
    }
}
