use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use types::{Reading, ReadingHistory, ReadingSink};

const MAX_CONNECTIONS: u32 = 5;

/// SQLite-backed reading history.
#[derive(Debug, Clone)]
pub struct ReadingStore {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl ReadingStore {
    /// Opens or creates the database at `path` (a file path or `sqlite:` URL).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = connect_options(path)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS readings (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                device_id TEXT NOT NULL,\
                timestamp_ms INTEGER NOT NULL,\
                solar_voltage REAL NOT NULL,\
                solar_current REAL NOT NULL,\
                output_voltage REAL NOT NULL,\
                output_current REAL NOT NULL,\
                internal_temp_c REAL NOT NULL,\
                panel_temp_c REAL NOT NULL,\
                aux_rail_voltage REAL NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_readings_device_ts ON readings(device_id, timestamp_ms)",
        )
        .execute(&pool)
        .await?;

        info!(path = %path, "reading store initialized");

        Ok(Self { pool })
    }

    pub async fn insert(&self, reading: &Reading) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO readings (device_id, timestamp_ms, solar_voltage, solar_current, \
             output_voltage, output_current, internal_temp_c, panel_temp_c, aux_rail_voltage) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&reading.device_id)
        .bind(reading.timestamp_ms)
        .bind(reading.solar_voltage)
        .bind(reading.solar_current)
        .bind(reading.output_voltage)
        .bind(reading.output_current)
        .bind(reading.internal_temp_c)
        .bind(reading.panel_temp_c)
        .bind(reading.aux_rail_voltage)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inclusive on both ends, oldest first.
    pub async fn range(&self, device_id: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Reading>, StoreError> {
        let rows = sqlx::query(
            "SELECT device_id, timestamp_ms, solar_voltage, solar_current, output_voltage, \
             output_current, internal_temp_c, panel_temp_c, aux_rail_voltage \
             FROM readings WHERE device_id = ? AND timestamp_ms BETWEEN ? AND ? \
             ORDER BY timestamp_ms ASC, id ASC",
        )
        .bind(device_id)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(reading_from_row).collect())
    }

    /// Deletes readings strictly older than `cutoff_ms`, returning how many went.
    pub async fn prune_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM readings WHERE timestamp_ms < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        debug!(cutoff_ms, removed, "reading store pruned");
        Ok(removed)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }
}

#[async_trait]
impl ReadingSink for ReadingStore {
    async fn sync_reading(&self, reading: &Reading) -> anyhow::Result<()> {
        self.insert(reading).await?;
        Ok(())
    }
}

#[async_trait]
impl ReadingHistory for ReadingStore {
    async fn query_range(&self, device_id: &str, start_ms: i64, end_ms: i64) -> anyhow::Result<Vec<Reading>> {
        Ok(self.range(device_id, start_ms, end_ms).await?)
    }
}

fn connect_options(path: &str) -> Result<SqliteConnectOptions, StoreError> {
    if path.starts_with("sqlite:") {
        Ok(SqliteConnectOptions::from_str(path)?)
    } else {
        Ok(SqliteConnectOptions::new().filename(path))
    }
}

fn reading_from_row(row: &SqliteRow) -> Reading {
    Reading {
        device_id: row.get("device_id"),
        timestamp_ms: row.get("timestamp_ms"),
        solar_voltage: row.get("solar_voltage"),
        solar_current: row.get("solar_current"),
        output_voltage: row.get("output_voltage"),
        output_current: row.get("output_current"),
        internal_temp_c: row.get("internal_temp_c"),
        panel_temp_c: row.get("panel_temp_c"),
        aux_rail_voltage: row.get("aux_rail_voltage"),
    }
}
