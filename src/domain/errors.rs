use thiserror::Error;

/// Invariant breaches raised by the position book.
///
/// These normally indicate an out-of-order or duplicated fill; callers
/// quarantine the offending event rather than crash the lane.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    #[error("direction conflict on {symbol}: book is {book_direction}, fill is {incoming}")]
    DirectionConflict {
        symbol: String,
        book_direction: String,
        incoming: String,
    },

    #[error("max lots exceeded on {symbol}: book already holds {max}")]
    MaxLotsExceeded { symbol: String, max: usize },

    #[error("lot {lot_id} not found on {symbol}")]
    LotNotFound { symbol: String, lot_id: String },
}

/// Malformed or out-of-order market data. Dropped and counted, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("bad input for {symbol}: {reason}")]
    BadInput { symbol: String, reason: String },

    #[error("stale tick for {symbol}: ts {ts_ms} < last seen {last_ts_ms}")]
    StaleTick {
        symbol: String,
        ts_ms: i64,
        last_ts_ms: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_error_formatting() {
        let err = BookError::DirectionConflict {
            symbol: "USDJPY".to_string(),
            book_direction: "LONG".to_string(),
            incoming: "SHORT".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("USDJPY"));
        assert!(msg.contains("LONG"));
        assert!(msg.contains("SHORT"));
    }

    #[test]
    fn test_stale_tick_formatting() {
        let err = FeedError::StaleTick {
            symbol: "EURUSD".to_string(),
            ts_ms: 900,
            last_ts_ms: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("900"));
        assert!(msg.contains("1000"));
    }
}
