pub mod consumer;
pub mod producer;

use anyhow::Result;
use rand::Rng;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use std::time::Duration;

/// Stream names shared by both roles.
pub const SIGNAL_STREAM: &str = "signals";
pub const FILL_STREAM: &str = "fills";

/// Bounded exponential backoff with jitter for transient bus errors.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Next delay to sleep, growing twofold up to the cap, with up to 25%
    /// random jitter so restarting consumers do not stampede.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 4);
        delay + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Raw read used by startup replay: every event for `symbol` appended
/// strictly after `after_ts_ms`, oldest first, bypassing group cursors.
pub async fn events_after_ts<T: DeserializeOwned>(
    pool: &SqlitePool,
    stream: &str,
    symbol: &str,
    after_ts_ms: i64,
) -> Result<Vec<T>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT payload FROM stream_events
        WHERE stream = ? AND symbol = ? AND created_ts_ms > ?
        ORDER BY id ASC
        "#,
    )
    .bind(stream)
    .bind(symbol)
    .bind(after_ts_ms)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|(payload,)| Ok(serde_json::from_str(payload)?))
        .collect()
}
