use crate::domain::errors::BookError;
use crate::domain::types::{Direction, Lot};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Ordered sequence of lots for one symbol, oldest first.
///
/// The book is either empty or holds lots of a single direction, never more
/// than `max_lots`. Mutations happen on the symbol's lane only, driven by
/// reconciled fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionBook {
    symbol: String,
    max_lots: usize,
    lots: VecDeque<Lot>,
}

impl PositionBook {
    pub fn new(symbol: impl Into<String>, max_lots: usize) -> Self {
        Self {
            symbol: symbol.into(),
            max_lots,
            lots: VecDeque::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn len(&self) -> usize {
        self.lots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.lots.front().map(|l| l.direction)
    }

    pub fn oldest(&self) -> Option<&Lot> {
        self.lots.front()
    }

    pub fn newest(&self) -> Option<&Lot> {
        self.lots.back()
    }

    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.iter()
    }

    pub fn lot_ids(&self) -> Vec<Uuid> {
        self.lots.iter().map(|l| l.lot_id).collect()
    }

    /// Append a freshly filled lot. The entry timestamp may not run backwards
    /// relative to the current newest lot.
    pub fn append(&mut self, lot: Lot) -> Result<(), BookError> {
        if let Some(direction) = self.direction()
            && direction != lot.direction
        {
            return Err(BookError::DirectionConflict {
                symbol: self.symbol.clone(),
                book_direction: direction.to_string(),
                incoming: lot.direction.to_string(),
            });
        }
        if self.lots.len() >= self.max_lots {
            return Err(BookError::MaxLotsExceeded {
                symbol: self.symbol.clone(),
                max: self.max_lots,
            });
        }
        self.lots.push_back(lot);
        Ok(())
    }

    pub fn close_oldest(&mut self) -> Option<Lot> {
        self.lots.pop_front()
    }

    pub fn close_newest(&mut self) -> Option<Lot> {
        self.lots.pop_back()
    }

    pub fn close_all(&mut self) -> Vec<Lot> {
        self.lots.drain(..).collect()
    }

    pub fn close_oldest_n(&mut self, n: usize) -> Vec<Lot> {
        let n = n.min(self.lots.len());
        self.lots.drain(..n).collect()
    }

    pub fn close_by_id(&mut self, lot_id: Uuid) -> Result<Lot, BookError> {
        match self.lots.iter().position(|l| l.lot_id == lot_id) {
            Some(idx) => Ok(self.lots.remove(idx).expect("index just located")),
            None => Err(BookError::LotNotFound {
                symbol: self.symbol.clone(),
                lot_id: lot_id.to_string(),
            }),
        }
    }

    /// Size-weighted mean entry price across the book.
    pub fn avg_entry_price(&self) -> Option<Decimal> {
        if self.lots.is_empty() {
            return None;
        }
        let total_size: Decimal = self.lots.iter().map(|l| l.size).sum();
        if total_size.is_zero() {
            return None;
        }
        let weighted: Decimal = self.lots.iter().map(|l| l.entry_price * l.size).sum();
        Some(weighted / total_size)
    }

    /// Entry price of the most recent remaining lot. This is the SCALE_OUT
    /// reference; after a scale-out it moves back to the new newest lot.
    pub fn prev_entry_price(&self) -> Option<Decimal> {
        self.lots.back().map(|l| l.entry_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::EntryStage;
    use rust_decimal_macros::dec;

    fn lot(direction: Direction, price: Decimal, ts_ms: i64, size: Decimal) -> Lot {
        Lot {
            lot_id: Uuid::new_v4(),
            symbol: "USDJPY".to_string(),
            direction,
            entry_price: price,
            entry_ts_ms: ts_ms,
            size,
            stage: EntryStage::Init,
            ma_thr_at_entry: dec!(0.01),
        }
    }

    #[test]
    fn test_append_preserves_fifo_order() {
        let mut book = PositionBook::new("USDJPY", 4);
        book.append(lot(Direction::Long, dec!(100), 1_000, dec!(1)))
            .unwrap();
        book.append(lot(Direction::Long, dec!(99), 2_000, dec!(1)))
            .unwrap();
        book.append(lot(Direction::Long, dec!(98), 3_000, dec!(1)))
            .unwrap();

        assert_eq!(book.oldest().unwrap().entry_price, dec!(100));
        assert_eq!(book.newest().unwrap().entry_price, dec!(98));
        let timestamps: Vec<i64> = book.lots().map(|l| l.entry_ts_ms).collect();
        assert_eq!(timestamps, vec![1_000, 2_000, 3_000]);
    }

    #[test]
    fn test_direction_conflict_rejected() {
        let mut book = PositionBook::new("USDJPY", 4);
        book.append(lot(Direction::Long, dec!(100), 0, dec!(1)))
            .unwrap();

        let err = book
            .append(lot(Direction::Short, dec!(101), 1, dec!(1)))
            .unwrap_err();
        assert!(matches!(err, BookError::DirectionConflict { .. }));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_max_lots_enforced() {
        let mut book = PositionBook::new("USDJPY", 4);
        for i in 0..4 {
            book.append(lot(Direction::Long, dec!(100), i, dec!(1)))
                .unwrap();
        }

        let err = book
            .append(lot(Direction::Long, dec!(99), 5, dec!(1)))
            .unwrap_err();
        assert!(matches!(err, BookError::MaxLotsExceeded { max: 4, .. }));
    }

    #[test]
    fn test_close_operations_keep_order() {
        let mut book = PositionBook::new("USDJPY", 4);
        for (i, price) in [dec!(100), dec!(99), dec!(98), dec!(97)].iter().enumerate() {
            book.append(lot(Direction::Long, *price, i as i64, dec!(1)))
                .unwrap();
        }

        assert_eq!(book.close_oldest().unwrap().entry_price, dec!(100));
        assert_eq!(book.close_newest().unwrap().entry_price, dec!(97));
        assert_eq!(book.oldest().unwrap().entry_price, dec!(99));
        assert_eq!(book.newest().unwrap().entry_price, dec!(98));

        let closed = book.close_oldest_n(5);
        assert_eq!(closed.len(), 2);
        assert!(book.is_empty());
        assert_eq!(book.direction(), None);
    }

    #[test]
    fn test_close_by_id() {
        let mut book = PositionBook::new("USDJPY", 4);
        let target = lot(Direction::Short, dec!(100), 0, dec!(1));
        let target_id = target.lot_id;
        book.append(target).unwrap();
        book.append(lot(Direction::Short, dec!(101), 1, dec!(1)))
            .unwrap();

        let closed = book.close_by_id(target_id).unwrap();
        assert_eq!(closed.lot_id, target_id);
        assert_eq!(book.len(), 1);

        let err = book.close_by_id(target_id).unwrap_err();
        assert!(matches!(err, BookError::LotNotFound { .. }));
    }

    #[test]
    fn test_avg_entry_price_is_size_weighted() {
        let mut book = PositionBook::new("USDJPY", 4);
        book.append(lot(Direction::Long, dec!(100), 0, dec!(1)))
            .unwrap();
        book.append(lot(Direction::Long, dec!(94), 1, dec!(2)))
            .unwrap();

        // (100*1 + 94*2) / 3 = 96
        assert_eq!(book.avg_entry_price().unwrap(), dec!(96));
    }

    #[test]
    fn test_prev_entry_price_tracks_newest_remaining() {
        let mut book = PositionBook::new("USDJPY", 4);
        book.append(lot(Direction::Long, dec!(100), 0, dec!(1)))
            .unwrap();
        book.append(lot(Direction::Long, dec!(98), 1, dec!(1)))
            .unwrap();
        assert_eq!(book.prev_entry_price().unwrap(), dec!(98));

        book.close_newest();
        assert_eq!(book.prev_entry_price().unwrap(), dec!(100));
    }
}
