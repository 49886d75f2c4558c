//! Persistent record store.
//!
//! One SQLite database holds every partition: a table per domain entity
//! type plus the settings partition used for pull checkpoints. The store
//! must be opened with [`RecordStore::init`] before use; every other call
//! fails with [`Error::NotInitialized`] until then.

use crate::{
    error::Result,
    schema::{self, Entity, IndexQuery},
    size::{calculate_object_size, StoreStats},
    Error, RecordId, StoredRecord, Table, Timestamp,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tokio::sync::RwLock;

/// Default pool size for file-backed databases.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// A raw record row.
struct RecordRow {
    id: String,
    data: String,
    synced: bool,
    version: i64,
    timestamp: i64,
    last_modified: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for RecordRow {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(RecordRow {
            id: row.try_get("id")?,
            data: row.try_get("data")?,
            synced: row.try_get("synced")?,
            version: row.try_get("version")?,
            timestamp: row.try_get("timestamp")?,
            last_modified: row.try_get("last_modified")?,
        })
    }
}

impl RecordRow {
    fn into_record(self) -> Result<StoredRecord<Value>> {
        Ok(StoredRecord {
            id: self.id,
            data: serde_json::from_str(&self.data)?,
            timestamp: self.timestamp,
            version: self.version,
            synced: self.synced,
            last_modified: self.last_modified,
        })
    }
}

/// Reject payloads that are not JSON objects.
fn ensure_object(data: &Value) -> Result<()> {
    if data.is_object() {
        Ok(())
    } else {
        Err(Error::InvalidPayload(format!(
            "record payload must be a JSON object, got {data}"
        )))
    }
}

/// Copy of a payload with its `id` field set to the record id.
///
/// Stored payloads are kept exactly as written; the id lives in its own
/// column. Rows handed to the queue, the remote or a typed decoder get it
/// added here.
pub(crate) fn with_id(mut data: Value, id: &str) -> Result<Value> {
    ensure_object(&data)?;
    if let Some(object) = data.as_object_mut() {
        object.insert("id".to_string(), Value::String(id.to_string()));
    }
    Ok(data)
}

/// Decode a stored payload into an entity, supplying `id` from the record.
pub(crate) fn decode_entity<E: DeserializeOwned>(
    record: StoredRecord<Value>,
) -> Result<StoredRecord<E>> {
    let id = record.id.clone();
    record.try_map(|data| -> Result<E> { Ok(serde_json::from_value(with_id(data, &id)?)?) })
}

fn owner_id(table: Table, data: &Value) -> Option<String> {
    let field = table.owner_field()?;
    data.get(field)?.as_str().map(str::to_string)
}

/// Keyed, versioned store of entity records.
pub struct RecordStore {
    database_url: String,
    max_connections: u32,
    pool: RwLock<Option<SqlitePool>>,
}

impl RecordStore {
    /// Create an unopened store for the given SQLite URL
    /// (e.g. `sqlite://harbor.db` or `sqlite::memory:`).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            pool: RwLock::new(None),
        }
    }

    /// Set the pool size used for file-backed databases.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    fn is_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    /// Open the database and create missing partitions. No-op when already open.
    pub async fn init(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut options = SqliteConnectOptions::from_str(&self.database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !self.is_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `sqlite::memory:` is its own database, so an
        // in-memory store keeps exactly one connection alive forever.
        let max_connections = if self.is_memory() {
            1
        } else {
            self.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        schema::upgrade(&pool).await?;

        tracing::debug!("Opened record store at {}", self.database_url);
        *guard = Some(pool);
        Ok(())
    }

    /// Close the database. Later calls fail until [`RecordStore::init`] runs again.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            tracing::debug!("Closed record store at {}", self.database_url);
        }
    }

    /// Whether [`RecordStore::init`] has completed.
    pub async fn is_initialized(&self) -> bool {
        self.pool.read().await.is_some()
    }

    pub(crate) async fn pool(&self) -> Result<SqlitePool> {
        self.pool.read().await.clone().ok_or(Error::NotInitialized)
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Insert or replace a record.
    pub async fn put(&self, table: Table, record: &StoredRecord<Value>) -> Result<()> {
        let pool = self.pool().await?;
        Self::put_with(&pool, table, record).await
    }

    /// Insert or replace a batch of records in one transaction.
    pub async fn put_many(&self, table: Table, records: &[StoredRecord<Value>]) -> Result<()> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;
        for record in records {
            Self::put_with(&mut *tx, table, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn put_with<'e, X>(
        executor: X,
        table: Table,
        record: &StoredRecord<Value>,
    ) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
    {
        ensure_object(&record.data)?;
        let owner = owner_id(table, &record.data);

        sqlx::query(&format!(
            "INSERT INTO {table} (id, data, owner_id, synced, version, timestamp, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                owner_id = excluded.owner_id,
                synced = excluded.synced,
                version = excluded.version,
                timestamp = excluded.timestamp,
                last_modified = excluded.last_modified"
        ))
        .bind(&record.id)
        .bind(serde_json::to_string(&record.data)?)
        .bind(owner)
        .bind(record.synced)
        .bind(record.version)
        .bind(record.timestamp)
        .bind(record.last_modified)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Get a record by id.
    pub async fn get(&self, table: Table, id: &str) -> Result<Option<StoredRecord<Value>>> {
        let pool = self.pool().await?;
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT id, data, synced, version, timestamp, last_modified FROM {table} WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&pool)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    /// Get all records, optionally narrowed by a secondary index.
    pub async fn get_all(
        &self,
        table: Table,
        index: &IndexQuery,
    ) -> Result<Vec<StoredRecord<Value>>> {
        let pool = self.pool().await?;
        let select = format!(
            "SELECT id, data, synced, version, timestamp, last_modified FROM {table}"
        );

        let rows = match index {
            IndexQuery::All => {
                sqlx::query_as::<_, RecordRow>(&format!("{select} ORDER BY timestamp, id"))
                    .fetch_all(&pool)
                    .await?
            }
            IndexQuery::OwnerId(owner) => {
                sqlx::query_as::<_, RecordRow>(&format!(
                    "{select} WHERE owner_id = ?1 ORDER BY timestamp, id"
                ))
                .bind(owner)
                .fetch_all(&pool)
                .await?
            }
            IndexQuery::Synced(synced) => {
                sqlx::query_as::<_, RecordRow>(&format!(
                    "{select} WHERE synced = ?1 ORDER BY timestamp, id"
                ))
                .bind(*synced)
                .fetch_all(&pool)
                .await?
            }
        };

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Delete a record. Returns whether it existed.
    pub async fn delete(&self, table: Table, id: &str) -> Result<bool> {
        let pool = self.pool().await?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every record of a partition.
    pub async fn clear(&self, table: Table) -> Result<()> {
        let pool = self.pool().await?;
        Self::clear_with(&pool, table).await?;
        tracing::debug!("Cleared partition {}", table);
        Ok(())
    }

    pub(crate) async fn clear_with<'e, X>(executor: X, table: Table) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Flag a record as confirmed by the remote. Returns whether it existed.
    pub async fn mark_synced(&self, table: Table, id: &str) -> Result<bool> {
        let pool = self.pool().await?;
        let result = sqlx::query(&format!("UPDATE {table} SET synced = 1 WHERE id = ?1"))
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a record to a new id in one transaction.
    pub(crate) async fn rekey(&self, table: Table, from: &str, to: &str) -> Result<bool> {
        let Some(mut record) = self.get(table, from).await? else {
            return Ok(false);
        };
        record.id = to.to_string();
        if let Some(object) = record.data.as_object_mut() {
            if object.get("id").and_then(Value::as_str) == Some(from) {
                object.insert("id".to_string(), Value::String(to.to_string()));
            }
        }

        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
            .bind(from)
            .execute(&mut *tx)
            .await?;
        Self::put_with(&mut *tx, table, &record).await?;
        tx.commit().await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------

    /// Insert or replace a typed record.
    pub async fn put_entity<E: Entity>(&self, record: &StoredRecord<E>) -> Result<()> {
        let record = record.clone().try_map(serde_json::to_value)?;
        self.put(E::TABLE, &record).await
    }

    /// Get a typed record by id.
    pub async fn get_entity<E: Entity>(&self, id: &str) -> Result<Option<StoredRecord<E>>> {
        self.get(E::TABLE, id).await?.map(decode_entity).transpose()
    }

    /// Get all typed records matching an index query.
    pub async fn get_all_entities<E: Entity>(
        &self,
        index: &IndexQuery,
    ) -> Result<Vec<StoredRecord<E>>> {
        self.get_all(E::TABLE, index)
            .await?
            .into_iter()
            .map(decode_entity)
            .collect()
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Read a setting.
    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let pool = self.pool().await?;
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&pool)
            .await?;

        value
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(Error::from)
    }

    /// Write a setting.
    pub async fn put_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let pool = self.pool().await?;
        Self::put_setting_with(&pool, key, value).await
    }

    pub(crate) async fn put_setting_with<'e, X, T>(executor: X, key: &str, value: &T) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
        T: Serialize + ?Sized,
    {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub(crate) async fn clear_settings_with<'e, X>(executor: X) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query("DELETE FROM settings").execute(executor).await?;
        Ok(())
    }

    /// Remove a setting.
    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&pool)
            .await?;
        Ok(())
    }

    /// Every setting, ordered by key.
    pub async fn all_settings(&self) -> Result<Vec<(String, Value)>> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM settings ORDER BY key")
                .fetch_all(&pool)
                .await?;

        rows.into_iter()
            .map(|(key, value)| Ok((key, serde_json::from_str(&value)?)))
            .collect()
    }

    /// Pull checkpoint of a table, if one was recorded.
    pub async fn last_sync(&self, table: Table) -> Result<Option<Timestamp>> {
        self.get_setting(&table.checkpoint_key()).await
    }

    /// Record the pull checkpoint of a table.
    pub async fn set_last_sync(&self, table: Table, at: Timestamp) -> Result<()> {
        self.put_setting(&table.checkpoint_key(), &at).await
    }

    // ------------------------------------------------------------------
    // Id mappings
    // ------------------------------------------------------------------

    /// Remember that a temp id was replaced by a server id.
    pub async fn record_id_mapping(
        &self,
        table: Table,
        temp_id: &str,
        server_id: &str,
        now: Timestamp,
    ) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query(
            "INSERT INTO id_mappings (table_name, temp_id, server_id, mapped_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(table_name, temp_id) DO UPDATE SET
                server_id = excluded.server_id,
                mapped_at = excluded.mapped_at",
        )
        .bind(table.as_str())
        .bind(temp_id)
        .bind(server_id)
        .bind(now)
        .execute(&pool)
        .await?;
        Ok(())
    }

    /// Translate a possibly stale temp id into the id the record lives under now.
    pub async fn resolve_id(&self, table: Table, id: &str) -> Result<RecordId> {
        let pool = self.pool().await?;
        let mapped: Option<String> = sqlx::query_scalar(
            "SELECT server_id FROM id_mappings WHERE table_name = ?1 AND temp_id = ?2",
        )
        .bind(table.as_str())
        .bind(id)
        .fetch_optional(&pool)
        .await?;
        Ok(mapped.unwrap_or_else(|| id.to_string()))
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Estimated size of every record in a partition.
    pub async fn get_store_size(&self, table: Table) -> Result<u64> {
        let records = self.get_all(table, &IndexQuery::All).await?;
        records.iter().map(record_size).sum()
    }

    /// Item count, size and unsynced count of a partition.
    pub async fn get_store_stats(&self, table: Table) -> Result<StoreStats> {
        let records = self.get_all(table, &IndexQuery::All).await?;

        let mut stats = StoreStats::default();
        for record in &records {
            stats.item_count += 1;
            stats.storage_size += record_size(record)?;
            if !record.synced {
                stats.unsynced_count += 1;
            }
        }
        Ok(stats)
    }
}

/// Estimated size of a stored record, bookkeeping fields included.
pub(crate) fn record_size<T: Serialize>(record: &T) -> Result<u64> {
    Ok(calculate_object_size(&serde_json::to_value(record)?))
}
