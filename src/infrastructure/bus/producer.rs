use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use std::marker::PhantomData;
use tracing::debug;

/// Sliding window inside which a repeated dedupe key is swallowed.
const DEDUPE_WINDOW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, PartialEq)]
pub enum AppendOutcome<T> {
    Appended { entry_id: i64 },
    /// An event with the same dedupe key exists inside the window. The
    /// original payload is returned so the caller can track it instead of
    /// the suppressed duplicate.
    Duplicate { original: T },
}

/// Append side of one durable stream. An append is durable once the insert
/// commits; entry ids are monotonic, so per-symbol order is append order.
pub struct StreamProducer<T> {
    pool: SqlitePool,
    stream: &'static str,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> StreamProducer<T> {
    pub fn new(pool: SqlitePool, stream: &'static str) -> Self {
        Self {
            pool,
            stream,
            _marker: PhantomData,
        }
    }

    /// Append one event. With a dedupe key, a hit inside the window returns
    /// `Duplicate` carrying the original event; the caller treats that as
    /// success.
    pub async fn append(
        &self,
        symbol: &str,
        dedupe_key: Option<&str>,
        now_ms: i64,
        event: &T,
    ) -> Result<AppendOutcome<T>> {
        let mut tx = self.pool.begin().await.context("begin append tx")?;

        if let Some(key) = dedupe_key {
            let existing: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT payload FROM stream_events
                WHERE stream = ? AND dedupe_key = ? AND created_ts_ms > ?
                ORDER BY id DESC LIMIT 1
                "#,
            )
            .bind(self.stream)
            .bind(key)
            .bind(now_ms - DEDUPE_WINDOW_MS)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((payload,)) = existing {
                tx.rollback().await.ok();
                debug!(stream = self.stream, symbol, key, "duplicate dedupe key, append swallowed");
                let original = serde_json::from_str(&payload)
                    .context("deserialize original event on dedupe hit")?;
                return Ok(AppendOutcome::Duplicate { original });
            }
        }

        let payload = serde_json::to_string(event).context("serialize stream event")?;
        let result = sqlx::query(
            r#"
            INSERT INTO stream_events (stream, symbol, dedupe_key, payload, created_ts_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(self.stream)
        .bind(symbol)
        .bind(dedupe_key)
        .bind(&payload)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.context("commit append tx")?;
        Ok(AppendOutcome::Appended {
            entry_id: result.last_insert_rowid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Direction, IntentAction, IntentEvent};
    use crate::infrastructure::bus::SIGNAL_STREAM;
    use crate::infrastructure::persistence::database::Database;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn intent(key: &str) -> IntentEvent {
        IntentEvent {
            event_id: Uuid::new_v4(),
            symbol: "USDJPY".to_string(),
            action: IntentAction::Init,
            direction: Direction::Long,
            reference_price: dec!(98.9),
            ts_ms: 0,
            size: dec!(1),
            ma_thr_at_entry: dec!(0.01),
            dedupe_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let db = Database::in_memory().await.unwrap();
        let producer: StreamProducer<IntentEvent> =
            StreamProducer::new(db.pool.clone(), SIGNAL_STREAM);

        let a = producer
            .append("USDJPY", Some("k1"), 1_000, &intent("k1"))
            .await
            .unwrap();
        let b = producer
            .append("USDJPY", Some("k2"), 2_000, &intent("k2"))
            .await
            .unwrap();

        match (a, b) {
            (AppendOutcome::Appended { entry_id: ia }, AppendOutcome::Appended { entry_id: ib }) => {
                assert!(ib > ia)
            }
            other => panic!("expected two appends, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_swallowed_inside_window() {
        let db = Database::in_memory().await.unwrap();
        let producer: StreamProducer<IntentEvent> =
            StreamProducer::new(db.pool.clone(), SIGNAL_STREAM);

        let first = intent("dup");
        producer
            .append("USDJPY", Some("dup"), 1_000, &first)
            .await
            .unwrap();

        let second = producer
            .append("USDJPY", Some("dup"), 2_000, &intent("dup"))
            .await
            .unwrap();
        match second {
            AppendOutcome::Duplicate { original } => {
                assert_eq!(original.event_id, first.event_id)
            }
            other => panic!("expected duplicate, got {:?}", other),
        }

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stream_events")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_accepted_after_window() {
        let db = Database::in_memory().await.unwrap();
        let producer: StreamProducer<IntentEvent> =
            StreamProducer::new(db.pool.clone(), SIGNAL_STREAM);

        producer
            .append("USDJPY", Some("dup"), 1_000, &intent("dup"))
            .await
            .unwrap();

        let later = producer
            .append("USDJPY", Some("dup"), 1_000 + DEDUPE_WINDOW_MS + 1, &intent("dup"))
            .await
            .unwrap();
        assert!(matches!(later, AppendOutcome::Appended { .. }));
    }
}
