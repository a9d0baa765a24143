use crate::domain::book::PositionBook;
use crate::domain::cooldown::CooldownRegistry;
use crate::domain::types::FillEvent;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

/// Everything a symbol lane needs to resume: the book, the indicator close
/// history, the cooldowns and the open candle's bucket boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub book: PositionBook,
    pub closes: Vec<Decimal>,
    pub cooldowns: CooldownRegistry,
    pub current_bucket_start_ms: Option<i64>,
    pub last_close: Option<Decimal>,
    pub taken_ts_ms: i64,
}

pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, snapshot: &SymbolSnapshot) -> Result<()> {
        let state = serde_json::to_string(snapshot).context("serialize snapshot")?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (symbol, state, taken_ts_ms)
            VALUES (?, ?, ?)
            ON CONFLICT (symbol) DO UPDATE SET state = excluded.state,
                                              taken_ts_ms = excluded.taken_ts_ms
            "#,
        )
        .bind(&snapshot.symbol)
        .bind(&state)
        .bind(snapshot.taken_ts_ms)
        .execute(&self.pool)
        .await
        .context("persist snapshot")?;
        Ok(())
    }

    pub async fn load(&self, symbol: &str) -> Result<Option<SymbolSnapshot>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM snapshots WHERE symbol = ?")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((state,)) => Ok(Some(
                serde_json::from_str(&state).context("deserialize snapshot")?,
            )),
            None => Ok(None),
        }
    }
}

/// Fills the reconciler refuses to apply. They wait here for the operator;
/// the pipeline keeps running.
pub struct QuarantineStore {
    pool: SqlitePool,
}

impl QuarantineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn quarantine(&self, fill: &FillEvent, reason: &str, now_ms: i64) -> Result<()> {
        warn!(
            symbol = %fill.symbol,
            fill_id = %fill.event_id,
            reason,
            "fill quarantined"
        );
        let payload = serde_json::to_string(fill).context("serialize quarantined fill")?;
        sqlx::query(
            r#"
            INSERT INTO quarantined_fills (symbol, reason, payload, quarantined_ts_ms)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&fill.symbol)
        .bind(reason)
        .bind(&payload)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("persist quarantined fill")?;
        Ok(())
    }

    pub async fn count(&self, symbol: &str) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM quarantined_fills WHERE symbol = ?")
                .bind(symbol)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

/// Idempotency ledger for executors: a logical event uuid is marked once,
/// re-deliveries of it become no-ops.
pub struct ProcessedLedger {
    pool: SqlitePool,
    scope: String,
}

impl ProcessedLedger {
    pub fn new(pool: SqlitePool, scope: impl Into<String>) -> Self {
        Self {
            pool,
            scope: scope.into(),
        }
    }

    pub async fn is_processed(&self, event_uuid: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM processed_events WHERE scope = ? AND event_uuid = ?",
        )
        .bind(&self.scope)
        .bind(event_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn mark(&self, event_uuid: &str, now_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_events (scope, event_uuid, processed_ts_ms)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&self.scope)
        .bind(event_uuid)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
