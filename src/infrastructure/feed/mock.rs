use crate::domain::ports::MarketDataService;
use crate::domain::types::Tick;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, Receiver, Sender};

/// Channel-backed feed for mock mode and tests. Whatever is pushed with
/// [`MockMarketFeed::push`] fans out to every subscriber; unknown-symbol
/// filtering is the dispatcher's job, not the feed's.
#[derive(Clone, Default)]
pub struct MockMarketFeed {
    subscribers: Arc<RwLock<Vec<Sender<Tick>>>>,
}

impl MockMarketFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, symbol: &str, price: Decimal, ts_ms: i64) {
        let tick = Tick {
            symbol: symbol.to_string(),
            price,
            ts_ms,
        };
        let mut subs = self.subscribers.write().await;
        let mut active = Vec::with_capacity(subs.len());
        for tx in subs.iter() {
            if tx.send(tick.clone()).await.is_ok() {
                active.push(tx.clone());
            }
        }
        *subs = active;
    }
}

#[async_trait]
impl MarketDataService for MockMarketFeed {
    async fn subscribe(&self, _symbols: Vec<String>) -> Result<Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_pushed_ticks_reach_subscriber() {
        let feed = MockMarketFeed::new();
        let mut rx = feed.subscribe(vec!["USDJPY".to_string()]).await.unwrap();

        feed.push("USDJPY", dec!(151.2), 1_000).await;
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "USDJPY");
        assert_eq!(tick.price, dec!(151.2));
        assert_eq!(tick.ts_ms, 1_000);
    }
}
