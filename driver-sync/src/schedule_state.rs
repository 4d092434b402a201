//! Durable scheduler bookkeeping
//!
//! Holds the last successful sync time and the consecutive-error count so
//! the circuit breaker keeps counting across process restarts. The state is
//! one JSON value written under a fixed key in a local SQLite key-value table.

use crate::config::StateConfig;
use crate::error::SyncResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedScheduleState {
    /// Epoch milliseconds of the last successful sync
    pub last_sync_time: Option<i64>,
    pub consecutive_error_count: u32,
}

impl PersistedScheduleState {
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_sync_time = Some(at.timestamp_millis());
        self.consecutive_error_count = 0;
    }

    /// Bump the error count and return the new value
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_error_count = self.consecutive_error_count.saturating_add(1);
        self.consecutive_error_count
    }
}

#[async_trait]
pub trait ScheduleStateStore: Send + Sync {
    async fn load(&self) -> SyncResult<Option<PersistedScheduleState>>;

    /// Replace the stored state in a single write
    async fn save(&self, state: &PersistedScheduleState) -> SyncResult<()>;
}

/// SQLite-backed state store
pub struct SqliteScheduleStore {
    pool: SqlitePool,
    key: String,
}

impl SqliteScheduleStore {
    pub async fn connect(config: &StateConfig) -> SyncResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            key: config.state_key.clone(),
        };
        store.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, key = %store.key, "Opened schedule state store");
        Ok(store)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ScheduleStateStore for SqliteScheduleStore {
    async fn load(&self) -> SyncResult<Option<PersistedScheduleState>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(&self.key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&value)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &PersistedScheduleState) -> SyncResult<()> {
        let value = serde_json::to_string(state)?;

        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Non-durable state store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    state: Mutex<Option<PersistedScheduleState>>,
    saves: AtomicUsize,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedScheduleState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Option<PersistedScheduleState> {
        *self.state.lock()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduleStateStore for InMemoryScheduleStore {
    async fn load(&self) -> SyncResult<Option<PersistedScheduleState>> {
        Ok(*self.state.lock())
    }

    async fn save(&self, state: &PersistedScheduleState) -> SyncResult<()> {
        *self.state.lock() = Some(*state);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
