use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared SQLite handle. The durable streams, consumer-group state,
/// snapshots and the quarantine all live in this one file (or in memory for
/// tests).
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://")
            && path_part != ":memory:"
        {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // A shared :memory: database only exists on its one connection.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// In-memory database for tests. A single connection keeps the data
    /// alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // 1. The durable streams. `stream` is 'signals' or 'fills'; ids are
        // monotonic per database, so per-symbol order follows append order.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream TEXT NOT NULL,
                symbol TEXT NOT NULL,
                dedupe_key TEXT,
                payload TEXT NOT NULL,
                created_ts_ms INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create stream_events table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_stream_events_stream_id
            ON stream_events (stream, id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create stream id index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_stream_events_dedupe
            ON stream_events (stream, dedupe_key, created_ts_ms);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create dedupe index")?;

        // 2. Consumer groups: one cursor per (stream, group), one pending row
        // per delivered-but-unacked event.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_cursors (
                stream TEXT NOT NULL,
                grp TEXT NOT NULL,
                last_delivered_id INTEGER NOT NULL DEFAULT 0,
                created_ts_ms INTEGER NOT NULL,
                PRIMARY KEY (stream, grp)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create group_cursors table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_deliveries (
                stream TEXT NOT NULL,
                grp TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                consumer TEXT NOT NULL,
                delivered_ts_ms INTEGER NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (stream, grp, event_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create pending_deliveries table")?;

        // 3. Executor idempotency ledger, keyed by the logical event uuid.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                scope TEXT NOT NULL,
                event_uuid TEXT NOT NULL,
                processed_ts_ms INTEGER NOT NULL,
                PRIMARY KEY (scope, event_uuid)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create processed_events table")?;

        // 4. Per-symbol generator snapshots.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                symbol TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                taken_ts_ms INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create snapshots table")?;

        // 5. Fills that would breach book invariants land here for the
        // operator instead of crashing a lane.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quarantined_fills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                reason TEXT NOT NULL,
                payload TEXT NOT NULL,
                quarantined_ts_ms INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create quarantined_fills table")?;

        Ok(())
    }
}
