use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One event handed to a consumer. Stays on the group's pending list until
/// acknowledged, so a consumer that dies mid-batch loses nothing.
#[derive(Debug, Clone)]
pub struct Delivered<T> {
    pub entry_id: i64,
    pub symbol: String,
    pub delivery_count: i64,
    pub event: T,
}

/// Consumer-group endpoint of one stream.
///
/// Delivery is at-least-once: the cursor advance and the pending insert
/// commit together, so an event goes to exactly one consumer of the group
/// and is re-deliverable until acked. Events appended before the group
/// existed are never delivered unless an operator rewinds.
pub struct GroupConsumer<T> {
    pool: SqlitePool,
    stream: &'static str,
    group: String,
    consumer: String,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> GroupConsumer<T> {
    pub fn new(
        pool: SqlitePool,
        stream: &'static str,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            stream,
            group: group.into(),
            consumer: consumer.into(),
            _marker: PhantomData,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Create the group at the stream's current tail if it does not exist.
    pub async fn ensure_group(&self, now_ms: i64) -> Result<()> {
        let tail: (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM stream_events WHERE stream = ?")
                .bind(self.stream)
                .fetch_one(&self.pool)
                .await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO group_cursors (stream, grp, last_delivered_id, created_ts_ms)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(self.stream)
        .bind(&self.group)
        .bind(tail.0)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            info!(
                stream = self.stream,
                group = %self.group,
                from_id = tail.0,
                "consumer group created"
            );
        }
        Ok(())
    }

    /// Operator rewind: reset the cursor so historical events replay.
    pub async fn rewind(&self, to_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE group_cursors SET last_delivered_id = ? WHERE stream = ? AND grp = ?",
        )
        .bind(to_id)
        .bind(self.stream)
        .bind(&self.group)
        .execute(&self.pool)
        .await?;
        info!(stream = self.stream, group = %self.group, to_id, "group cursor rewound");
        Ok(())
    }

    /// Read up to `max` new events, blocking up to `block` while the stream
    /// is quiet. Returns an empty batch on timeout.
    pub async fn read_batch(&self, max: usize, block: Duration) -> Result<Vec<Delivered<T>>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let batch = self.read_once(max, now_ms).await?;
            if !batch.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// One non-blocking delivery attempt. Cursor advance and pending rows
    /// commit atomically.
    pub async fn read_once(&self, max: usize, now_ms: i64) -> Result<Vec<Delivered<T>>> {
        let mut tx = self.pool.begin().await.context("begin read tx")?;

        let cursor: Option<(i64,)> = sqlx::query_as(
            "SELECT last_delivered_id FROM group_cursors WHERE stream = ? AND grp = ?",
        )
        .bind(self.stream)
        .bind(&self.group)
        .fetch_optional(&mut *tx)
        .await?;
        let last_id = cursor
            .with_context(|| format!("consumer group '{}' not created", self.group))?
            .0;

        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT id, symbol, payload FROM stream_events
            WHERE stream = ? AND id > ?
            ORDER BY id ASC LIMIT ?
            "#,
        )
        .bind(self.stream)
        .bind(last_id)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await.ok();
            return Ok(Vec::new());
        }

        let max_id = rows.last().map(|(id, _, _)| *id).unwrap_or(last_id);
        for (id, _, _) in &rows {
            sqlx::query(
                r#"
                INSERT INTO pending_deliveries
                    (stream, grp, event_id, consumer, delivered_ts_ms, delivery_count)
                VALUES (?, ?, ?, ?, ?, 1)
                "#,
            )
            .bind(self.stream)
            .bind(&self.group)
            .bind(id)
            .bind(&self.consumer)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE group_cursors SET last_delivered_id = ? WHERE stream = ? AND grp = ?")
            .bind(max_id)
            .bind(self.stream)
            .bind(&self.group)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("commit read tx")?;

        debug!(
            stream = self.stream,
            group = %self.group,
            consumer = %self.consumer,
            n = rows.len(),
            "batch delivered"
        );
        self.decode_rows(rows.into_iter().map(|(id, sym, payload)| (id, sym, payload, 1)))
    }

    /// Acknowledge one entry; it leaves the pending list for good.
    pub async fn ack(&self, entry_id: i64) -> Result<()> {
        sqlx::query(
            "DELETE FROM pending_deliveries WHERE stream = ? AND grp = ? AND event_id = ?",
        )
        .bind(self.stream)
        .bind(&self.group)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// This consumer's own unacked deliveries, oldest first. Processed on
    /// startup before any new reads.
    pub async fn pending_for_me(&self) -> Result<Vec<Delivered<T>>> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT e.id, e.symbol, e.payload, p.delivery_count
            FROM pending_deliveries p
            JOIN stream_events e ON e.id = p.event_id AND e.stream = p.stream
            WHERE p.stream = ? AND p.grp = ? AND p.consumer = ?
            ORDER BY e.id ASC
            "#,
        )
        .bind(self.stream)
        .bind(&self.group)
        .bind(&self.consumer)
        .fetch_all(&self.pool)
        .await?;
        self.decode_rows(rows.into_iter())
    }

    /// Take over group entries idle longer than `idle_ms`, regardless of
    /// their previous owner. Returns the re-claimed events.
    pub async fn claim_idle(&self, idle_ms: i64, now_ms: i64) -> Result<Vec<Delivered<T>>> {
        let mut tx = self.pool.begin().await.context("begin claim tx")?;

        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT e.id, e.symbol, e.payload, p.delivery_count
            FROM pending_deliveries p
            JOIN stream_events e ON e.id = p.event_id AND e.stream = p.stream
            WHERE p.stream = ? AND p.grp = ? AND p.delivered_ts_ms <= ?
            ORDER BY e.id ASC
            "#,
        )
        .bind(self.stream)
        .bind(&self.group)
        .bind(now_ms - idle_ms)
        .fetch_all(&mut *tx)
        .await?;

        for (id, _, _, _) in &rows {
            sqlx::query(
                r#"
                UPDATE pending_deliveries
                SET consumer = ?, delivered_ts_ms = ?, delivery_count = delivery_count + 1
                WHERE stream = ? AND grp = ? AND event_id = ?
                "#,
            )
            .bind(&self.consumer)
            .bind(now_ms)
            .bind(self.stream)
            .bind(&self.group)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("commit claim tx")?;

        if !rows.is_empty() {
            info!(
                stream = self.stream,
                group = %self.group,
                consumer = %self.consumer,
                n = rows.len(),
                "re-claimed idle pending entries"
            );
        }
        self.decode_rows(
            rows.into_iter()
                .map(|(id, sym, payload, count)| (id, sym, payload, count + 1)),
        )
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pending_deliveries WHERE stream = ? AND grp = ?",
        )
        .bind(self.stream)
        .bind(&self.group)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    fn decode_rows(
        &self,
        rows: impl Iterator<Item = (i64, String, String, i64)>,
    ) -> Result<Vec<Delivered<T>>> {
        rows.map(|(entry_id, symbol, payload, delivery_count)| {
            let event = serde_json::from_str(&payload)
                .with_context(|| format!("decode stream entry {}", entry_id))?;
            Ok(Delivered {
                entry_id,
                symbol,
                delivery_count,
                event,
            })
        })
        .collect()
    }
}
