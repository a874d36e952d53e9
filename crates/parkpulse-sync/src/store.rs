//! Idempotent natural-key upserts into the backing store.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use parkpulse_core::{
    CrowdPrediction, LiveAttractionSnapshot, LiveParkSnapshot, ParkHoursDay, WeatherForecastDay,
};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Forecast rows older than this many days before today are purged.
pub const WEATHER_RETENTION_DAYS: i64 = 2;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("could not serialize {table} row: {source}")]
    Serialize {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("store rejected batch for {table}: {source}")]
    Database {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("store rejected batch for {table}: {message}")]
    Rejected { table: &'static str, message: String },
}

/// A record kind with a fixed table shape and natural key.
pub trait StoreRecord: Serialize + Send + Sync {
    const TABLE: &'static str;
    /// Column order; equal to the serde field names.
    const COLUMNS: &'static [&'static str];
    const CONFLICT_KEYS: &'static [&'static str];

    fn natural_key(&self) -> String;
}

impl StoreRecord for CrowdPrediction {
    const TABLE: &'static str = "park_crowd_predictions";
    const COLUMNS: &'static [&'static str] = &[
        "park_id",
        "date",
        "wait_time",
        "crowd_level",
        "description",
        "recommendation",
        "source",
        "synced_at",
    ];
    const CONFLICT_KEYS: &'static [&'static str] = &["park_id", "date"];

    fn natural_key(&self) -> String {
        format!("{}|{}", self.park_id, self.date)
    }
}

impl StoreRecord for LiveParkSnapshot {
    const TABLE: &'static str = "live_parks";
    const COLUMNS: &'static [&'static str] = &[
        "park_id",
        "name",
        "status",
        "timezone",
        "opening_time",
        "closing_time",
        "early_entry_start",
        "early_entry_end",
        "extended_evening_start",
        "extended_evening_end",
        "updated_at",
    ];
    const CONFLICT_KEYS: &'static [&'static str] = &["park_id"];

    fn natural_key(&self) -> String {
        self.park_id.clone()
    }
}

impl StoreRecord for LiveAttractionSnapshot {
    const TABLE: &'static str = "live_attractions";
    const COLUMNS: &'static [&'static str] = &[
        "park_id",
        "attraction_id",
        "name",
        "status",
        "operating_status",
        "wait_time",
        "updated_at",
    ];
    const CONFLICT_KEYS: &'static [&'static str] = &["park_id", "attraction_id"];

    fn natural_key(&self) -> String {
        format!("{}|{}", self.park_id, self.attraction_id)
    }
}

impl StoreRecord for ParkHoursDay {
    const TABLE: &'static str = "park_hours";
    const COLUMNS: &'static [&'static str] = &[
        "park_id",
        "date",
        "opening_time",
        "closing_time",
        "early_entry_start",
        "early_entry_end",
        "extended_evening_start",
        "extended_evening_end",
        "synced_at",
    ];
    const CONFLICT_KEYS: &'static [&'static str] = &["park_id", "date"];

    fn natural_key(&self) -> String {
        format!("{}|{}", self.park_id, self.date)
    }
}

impl StoreRecord for WeatherForecastDay {
    const TABLE: &'static str = "weather_forecasts";
    const COLUMNS: &'static [&'static str] = &[
        "location_id",
        "forecast_date",
        "temp_high",
        "temp_low",
        "feels_like",
        "humidity",
        "precipitation_chance",
        "precipitation_amount",
        "condition",
        "description",
        "wind_speed",
        "wind_direction",
        "uv_index",
        "visibility",
        "fetched_at",
    ];
    const CONFLICT_KEYS: &'static [&'static str] = &["location_id", "forecast_date"];

    fn natural_key(&self) -> String {
        format!("{}|{}", self.location_id, self.forecast_date)
    }
}

/// Table-tagged JSON rows, unique by natural key.
#[derive(Debug, Clone)]
pub struct UpsertBatch {
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub conflict_keys: &'static [&'static str],
    pub rows: Vec<(String, Value)>,
}

impl UpsertBatch {
    /// Duplicate natural keys collapse to the last occurrence, keeping the
    /// position of the first.
    pub fn from_records<R: StoreRecord>(records: &[R]) -> Result<Self, WriteError> {
        let mut rows: Vec<(String, Value)> = Vec::with_capacity(records.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for record in records {
            let key = record.natural_key();
            let value = serde_json::to_value(record).map_err(|source| WriteError::Serialize {
                table: R::TABLE,
                source,
            })?;
            match positions.get(&key) {
                Some(&idx) => rows[idx].1 = value,
                None => {
                    positions.insert(key.clone(), rows.len());
                    rows.push((key, value));
                }
            }
        }
        Ok(Self {
            table: R::TABLE,
            columns: R::COLUMNS,
            conflict_keys: R::CONFLICT_KEYS,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn payload(&self) -> Value {
        Value::Array(self.rows.iter().map(|(_, row)| row.clone()).collect())
    }

    /// One statement that inserts or fully overwrites every row of the batch.
    pub fn upsert_sql(&self) -> String {
        let columns = self.columns.join(", ");
        let updates = self
            .columns
            .iter()
            .filter(|c| !self.conflict_keys.contains(*c))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb) \
             ON CONFLICT ({keys}) DO UPDATE SET {updates}",
            table = self.table,
            keys = self.conflict_keys.join(", "),
        )
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn upsert(&self, batch: &UpsertBatch) -> Result<u64, WriteError>;

    /// Delete rows for `key` whose `date_column` is strictly before `cutoff`.
    async fn delete_before(
        &self,
        table: &'static str,
        date_column: &'static str,
        key_column: &'static str,
        key: &str,
        cutoff: NaiveDate,
    ) -> Result<u64, WriteError>;
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "park_crowd_predictions",
        r#"
        CREATE TABLE IF NOT EXISTS park_crowd_predictions (
            park_id        TEXT        NOT NULL,
            date           DATE        NOT NULL,
            wait_time      INTEGER     NOT NULL,
            crowd_level    SMALLINT    NOT NULL,
            description    TEXT        NOT NULL,
            recommendation TEXT        NOT NULL,
            source         TEXT        NOT NULL,
            synced_at      TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (park_id, date)
        )
        "#,
    ),
    (
        "live_parks",
        r#"
        CREATE TABLE IF NOT EXISTS live_parks (
            park_id                TEXT PRIMARY KEY,
            name                   TEXT        NOT NULL,
            status                 TEXT        NOT NULL,
            timezone               TEXT        NOT NULL,
            opening_time           TIMESTAMPTZ,
            closing_time           TIMESTAMPTZ,
            early_entry_start      TIMESTAMPTZ,
            early_entry_end        TIMESTAMPTZ,
            extended_evening_start TIMESTAMPTZ,
            extended_evening_end   TIMESTAMPTZ,
            updated_at             TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "live_attractions",
        r#"
        CREATE TABLE IF NOT EXISTS live_attractions (
            park_id          TEXT        NOT NULL,
            attraction_id    TEXT        NOT NULL,
            name             TEXT        NOT NULL,
            status           TEXT        NOT NULL,
            operating_status TEXT        NOT NULL,
            wait_time        INTEGER,
            updated_at       TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (park_id, attraction_id)
        )
        "#,
    ),
    (
        "park_hours",
        r#"
        CREATE TABLE IF NOT EXISTS park_hours (
            park_id                TEXT        NOT NULL,
            date                   DATE        NOT NULL,
            opening_time           TIMESTAMPTZ,
            closing_time           TIMESTAMPTZ,
            early_entry_start      TIMESTAMPTZ,
            early_entry_end        TIMESTAMPTZ,
            extended_evening_start TIMESTAMPTZ,
            extended_evening_end   TIMESTAMPTZ,
            synced_at              TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (park_id, date)
        )
        "#,
    ),
    (
        "weather_forecasts",
        r#"
        CREATE TABLE IF NOT EXISTS weather_forecasts (
            location_id          TEXT             NOT NULL,
            forecast_date        DATE             NOT NULL,
            temp_high            INTEGER          NOT NULL,
            temp_low             INTEGER          NOT NULL,
            feels_like           INTEGER          NOT NULL,
            humidity             INTEGER          NOT NULL,
            precipitation_chance INTEGER          NOT NULL,
            precipitation_amount DOUBLE PRECISION NOT NULL,
            condition            TEXT             NOT NULL,
            description          TEXT             NOT NULL,
            wind_speed           INTEGER          NOT NULL,
            wind_direction       INTEGER          NOT NULL,
            uv_index             INTEGER          NOT NULL,
            visibility           DOUBLE PRECISION NOT NULL,
            fetched_at           TIMESTAMPTZ      NOT NULL,
            PRIMARY KEY (location_id, forecast_date)
        )
        "#,
    ),
];

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// `password` overrides any password embedded in `database_url`.
    pub async fn connect(
        database_url: &str,
        password: Option<&str>,
        max_connections: u32,
    ) -> Result<Self> {
        let mut options =
            PgConnectOptions::from_str(database_url).context("parsing DATABASE_URL")?;
        if let Some(password) = password {
            options = options.password(password);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for (table, ddl) in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("creating table {table}"))?;
            debug!(table, "table ready");
        }
        info!(tables = SCHEMA.len(), "store schema ensured");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(&self, batch: &UpsertBatch) -> Result<u64, WriteError> {
        let result = sqlx::query(&batch.upsert_sql())
            .bind(batch.payload())
            .execute(&self.pool)
            .await
            .map_err(|source| WriteError::Database {
                table: batch.table,
                source,
            })?;
        Ok(result.rows_affected())
    }

    async fn delete_before(
        &self,
        table: &'static str,
        date_column: &'static str,
        key_column: &'static str,
        key: &str,
        cutoff: NaiveDate,
    ) -> Result<u64, WriteError> {
        let sql = format!("DELETE FROM {table} WHERE {key_column} = $1 AND {date_column} < $2");
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|source| WriteError::Database { table, source })?;
        Ok(result.rows_affected())
    }
}

/// Natural-key map per table. Used by tests and offline replays.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<&'static str, BTreeMap<String, Value>>>,
    rejecting: Option<&'static str>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects every batch for `table`.
    pub fn rejecting(table: &'static str) -> Self {
        Self {
            rejecting: Some(table),
            ..Self::default()
        }
    }

    pub async fn count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, BTreeMap::len)
    }

    /// Rows of `table` in natural-key order.
    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, batch: &UpsertBatch) -> Result<u64, WriteError> {
        if self.rejecting == Some(batch.table) {
            return Err(WriteError::Rejected {
                table: batch.table,
                message: "table is read-only".to_string(),
            });
        }
        let mut tables = self.tables.lock().await;
        let table = tables.entry(batch.table).or_default();
        for (key, row) in &batch.rows {
            table.insert(key.clone(), row.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn delete_before(
        &self,
        table: &'static str,
        date_column: &'static str,
        key_column: &'static str,
        key: &str,
        cutoff: NaiveDate,
    ) -> Result<u64, WriteError> {
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, row| {
            let same_key = row.get(key_column).and_then(Value::as_str) == Some(key);
            let stale = row
                .get(date_column)
                .and_then(Value::as_str)
                .and_then(|d| d.parse::<NaiveDate>().ok())
                .is_some_and(|d| d < cutoff);
            !(same_key && stale)
        });
        Ok((before - rows.len()) as u64)
    }
}

/// Logs what would be written. Selected when no database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunStore;

#[async_trait]
impl RecordStore for DryRunStore {
    fn backend(&self) -> &'static str {
        "dry-run"
    }

    async fn upsert(&self, batch: &UpsertBatch) -> Result<u64, WriteError> {
        info!(table = batch.table, rows = batch.len(), "simulated upsert");
        Ok(batch.len() as u64)
    }

    async fn delete_before(
        &self,
        table: &'static str,
        date_column: &'static str,
        _key_column: &'static str,
        key: &str,
        cutoff: NaiveDate,
    ) -> Result<u64, WriteError> {
        info!(table, key, %cutoff, date_column, "simulated purge");
        Ok(0)
    }
}

#[derive(Clone)]
pub struct UpsertWriter {
    store: Arc<dyn RecordStore>,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Upsert all records in one batch; returns the number of distinct rows.
    pub async fn write<R: StoreRecord>(&self, records: &[R]) -> Result<usize, WriteError> {
        if records.is_empty() {
            return Ok(0);
        }
        let batch = UpsertBatch::from_records(records)?;
        self.store.upsert(&batch).await?;
        debug!(table = R::TABLE, rows = batch.len(), backend = self.backend(), "upserted");
        Ok(batch.len())
    }

    /// Drop forecasts older than the retention window. Failures are logged only.
    pub async fn purge_stale_weather(&self, location_id: &str, today: NaiveDate) -> u64 {
        let cutoff = today - chrono::Duration::days(WEATHER_RETENTION_DAYS);
        match self
            .store
            .delete_before(
                WeatherForecastDay::TABLE,
                "forecast_date",
                "location_id",
                location_id,
                cutoff,
            )
            .await
        {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(location_id, deleted, %cutoff, "purged stale forecasts");
                }
                deleted
            }
            Err(err) => {
                warn!(location_id, error = %err, "stale forecast purge failed");
                0
            }
        }
    }
}
