use crate::StorageError;
use async_trait::async_trait;
use chatlog_core::{real_messages, TimelineEntry};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Durable per-conversation key-value store for cached timelines.
///
/// `set` replaces the whole entry and reports `false` when the write did not
/// land; callers must not assume success.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<Vec<TimelineEntry>>, StorageError>;
    async fn set(&self, conversation_id: &str, entries: &[TimelineEntry]) -> bool;
    async fn remove(&self, conversation_id: &str) -> Result<(), StorageError>;
    async fn conversation_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Timestamp of the newest real message in the entry.
    async fn frontier(&self, conversation_id: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.get(conversation_id).await?.and_then(|entries| {
            real_messages(&entries).map(|message| message.timestamp).max()
        }))
    }
}

#[derive(Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30))
            .pragma("temp_store", "memory");

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database; a single connection keeps every query on
    /// the same database.
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn write(
        &self,
        conversation_id: &str,
        entries: &[TimelineEntry],
    ) -> Result<(), StorageError> {
        let entries_json = serde_json::to_string(entries)?;
        let mut real = real_messages(entries).map(|message| message.timestamp);
        let first = real.next();
        let (earliest, latest) = real.fold((first, first), |(lo, hi), ts| {
            (lo.map(|lo| lo.min(ts)), hi.map(|hi| hi.max(ts)))
        });

        sqlx::query(
            r#"
            INSERT INTO message_cache (
              conversation_id, entries_json, entry_count, earliest_at, latest_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(conversation_id) DO UPDATE SET
              entries_json = excluded.entries_json,
              entry_count = excluded.entry_count,
              earliest_at = excluded.earliest_at,
              latest_at = excluded.latest_at,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(entries_json)
        .bind(entries.len() as i64)
        .bind(earliest.map(|ts| ts.to_rfc3339()))
        .bind(latest.map(|ts| ts.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Vec<TimelineEntry>>, StorageError> {
        let row = sqlx::query("SELECT entries_json FROM message_cache WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("entries_json")?;
        parse_json(&raw, "message_cache.entries_json").map(Some)
    }

    async fn set(&self, conversation_id: &str, entries: &[TimelineEntry]) -> bool {
        match self.write(conversation_id, entries).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(conversation = %conversation_id, error = %err, "cache write failed");
                false
            }
        }
    }

    async fn remove(&self, conversation_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM message_cache WHERE conversation_id = ?1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn conversation_ids(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT conversation_id FROM message_cache ORDER BY conversation_id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("conversation_id").map_err(StorageError::from))
            .collect()
    }

    async fn frontier(&self, conversation_id: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query("SELECT latest_at FROM message_cache WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        let latest_raw: Option<String> = match row {
            Some(row) => row.try_get("latest_at")?,
            None => None,
        };
        latest_raw
            .map(|raw| parse_datetime(&raw, "message_cache.latest_at"))
            .transpose()
    }
}

/// Process-local store, used by tests and for running without a database.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, Vec<TimelineEntry>>>,
    reject_writes: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every `set` call reports failure and leaves the entry untouched.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Vec<TimelineEntry>>, StorageError> {
        Ok(self.entries.read().await.get(conversation_id).cloned())
    }

    async fn set(&self, conversation_id: &str, entries: &[TimelineEntry]) -> bool {
        if self.reject_writes.load(Ordering::SeqCst) {
            return false;
        }
        self.entries
            .write()
            .await
            .insert(conversation_id.to_string(), entries.to_vec());
        true
    }

    async fn remove(&self, conversation_id: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(conversation_id);
        Ok(())
    }

    async fn conversation_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}
