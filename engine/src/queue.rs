//! Durable sync operation queue.
//!
//! Operations live in the `sync_queue` partition of the record store's
//! database and survive restarts. They are listed in insertion order.

use crate::{
    error::Result,
    operation::{OperationKind, OperationPatch, SyncOperation},
    store::{record_size, with_id},
    size::StoreStats,
    Error, OperationId, RecordStore, Table, Timestamp,
};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

struct OperationRow {
    id: String,
    kind: String,
    table_name: String,
    record_id: String,
    data: String,
    timestamp: i64,
    retry_count: i64,
    last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for OperationRow {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(OperationRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            data: row.try_get("data")?,
            timestamp: row.try_get("timestamp")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl OperationRow {
    fn into_operation(self) -> Result<SyncOperation> {
        Ok(SyncOperation {
            id: self.id,
            kind: self.kind.parse()?,
            table: self.table_name.parse()?,
            record_id: self.record_id,
            data: serde_json::from_str(&self.data)?,
            timestamp: self.timestamp,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            last_error: self.last_error,
        })
    }
}

const SELECT_OPERATIONS: &str = "SELECT id, kind, table_name, record_id, data, timestamp, \
                                 retry_count, last_error FROM sync_queue";

/// The durable log of pending mutations.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<RecordStore>,
}

impl SyncQueue {
    /// Create a queue sharing the record store's database.
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Persist a new operation and return its id.
    ///
    /// `data` must be a JSON object; its `id` field names the target record.
    /// A fresh operation id is generated when `id` is `None`.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        table: Table,
        data: Value,
        id: Option<OperationId>,
        now: Timestamp,
    ) -> Result<OperationId> {
        let record_id = data
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::InvalidPayload("sync operation data must carry a string id".into())
            })?;
        let data = with_id(data, &record_id)?;
        let op_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let operation = SyncOperation::new(op_id, kind, table, record_id, data, now);

        self.insert(&operation).await?;
        tracing::debug!(
            "Queued {} {}/{} as {}",
            operation.kind,
            operation.table,
            operation.record_id,
            operation.id
        );
        Ok(operation.id)
    }

    /// Persist a fully-formed operation, replacing one with the same id.
    pub async fn insert(&self, operation: &SyncOperation) -> Result<()> {
        let pool = self.store.pool().await?;
        Self::insert_with(&pool, operation).await
    }

    pub(crate) async fn insert_with<'e, X>(executor: X, operation: &SyncOperation) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO sync_queue
                (id, kind, table_name, record_id, data, timestamp, retry_count, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                table_name = excluded.table_name,
                record_id = excluded.record_id,
                data = excluded.data,
                timestamp = excluded.timestamp,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error",
        )
        .bind(&operation.id)
        .bind(operation.kind.as_str())
        .bind(operation.table.as_str())
        .bind(&operation.record_id)
        .bind(serde_json::to_string(&operation.data)?)
        .bind(operation.timestamp)
        .bind(i64::from(operation.retry_count))
        .bind(&operation.last_error)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// All queued operations in insertion order.
    pub async fn list(&self) -> Result<Vec<SyncOperation>> {
        let pool = self.store.pool().await?;
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "{SELECT_OPERATIONS} ORDER BY rowid"
        ))
        .fetch_all(&pool)
        .await?;

        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    /// Get one operation.
    pub async fn get(&self, id: &str) -> Result<Option<SyncOperation>> {
        let pool = self.store.pool().await?;
        let row = sqlx::query_as::<_, OperationRow>(&format!("{SELECT_OPERATIONS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&pool)
            .await?;

        row.map(OperationRow::into_operation).transpose()
    }

    /// Number of queued operations.
    pub async fn len(&self) -> Result<u64> {
        let pool = self.store.pool().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove an operation. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let pool = self.store.pool().await?;
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Apply a partial update and return the updated operation.
    pub async fn update(&self, id: &str, patch: OperationPatch) -> Result<SyncOperation> {
        let mut operation = self
            .get(id)
            .await?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        operation.apply(patch);
        self.insert(&operation).await?;
        Ok(operation)
    }

    /// Operations still waiting for the given record, oldest first.
    pub async fn pending_for_record(
        &self,
        table: Table,
        record_id: &str,
    ) -> Result<Vec<SyncOperation>> {
        let pool = self.store.pool().await?;
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "{SELECT_OPERATIONS} WHERE table_name = ?1 AND record_id = ?2 ORDER BY rowid"
        ))
        .bind(table.as_str())
        .bind(record_id)
        .fetch_all(&pool)
        .await?;

        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    /// Drop every operation waiting for the given record. Returns how many.
    pub async fn remove_for_record(&self, table: Table, record_id: &str) -> Result<u64> {
        let pool = self.store.pool().await?;
        let result = sqlx::query("DELETE FROM sync_queue WHERE table_name = ?1 AND record_id = ?2")
            .bind(table.as_str())
            .bind(record_id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Point queued operations at a record's new id.
    ///
    /// Rewrites the target of operations on `table`/`from`, and any
    /// top-level field of any queued row whose value is exactly `from`.
    pub async fn rewrite_record_id(&self, table: Table, from: &str, to: &str) -> Result<u64> {
        let mut rewritten = 0;
        for mut operation in self.list().await? {
            let mut changed = false;
            if operation.table == table && operation.record_id == from {
                operation.record_id = to.to_string();
                changed = true;
            }
            if let Some(object) = operation.data.as_object_mut() {
                for value in object.values_mut() {
                    if value.as_str() == Some(from) {
                        *value = Value::String(to.to_string());
                        changed = true;
                    }
                }
            }
            if changed {
                self.insert(&operation).await?;
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    /// Drop every queued operation.
    pub async fn clear(&self) -> Result<()> {
        let pool = self.store.pool().await?;
        Self::clear_with(&pool).await
    }

    pub(crate) async fn clear_with<'e, X>(executor: X) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query("DELETE FROM sync_queue").execute(executor).await?;
        Ok(())
    }

    /// Item count and estimated size of the queue.
    pub async fn stats(&self) -> Result<StoreStats> {
        let operations = self.list().await?;
        let mut stats = StoreStats::default();
        for operation in &operations {
            stats.item_count += 1;
            stats.storage_size += record_size(operation)?;
            stats.unsynced_count += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_queue() -> SyncQueue {
        let store = Arc::new(RecordStore::new("sqlite::memory:"));
        store.init().await.unwrap();
        SyncQueue::new(store)
    }

    #[tokio::test]
    async fn enqueue_generates_id() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(
                OperationKind::Create,
                Table::Patients,
                json!({"id": "temp_1_a", "first_name": "John"}),
                None,
                1000,
            )
            .await
            .unwrap();

        let ops = queue.list().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, id);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[0].table, Table::Patients);
        assert_eq!(ops[0].record_id, "temp_1_a");
        assert_eq!(ops[0].retry_count, 0);
    }

    #[tokio::test]
    async fn enqueue_with_explicit_id() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(
                OperationKind::Delete,
                Table::Clinics,
                json!({"id": "c-1"}),
                Some("op-7".into()),
                1000,
            )
            .await
            .unwrap();
        assert_eq!(id, "op-7");
        assert!(queue.get("op-7").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enqueue_requires_record_id() {
        let queue = open_queue().await;
        let result = queue
            .enqueue(OperationKind::Create, Table::Patients, json!({}), None, 1)
            .await;
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn list_preserves_insertion_order() {
        let queue = open_queue().await;
        for i in 0..5 {
            queue
                .enqueue(
                    OperationKind::Update,
                    Table::Treatments,
                    json!({"id": format!("t-{i}")}),
                    Some(format!("op-{i}")),
                    // Timestamps deliberately out of order.
                    100 - i,
                )
                .await
                .unwrap();
        }

        let ids: Vec<_> = queue.list().await.unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, ["op-0", "op-1", "op-2", "op-3", "op-4"]);
    }

    #[tokio::test]
    async fn update_and_remove() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(
                OperationKind::Update,
                Table::Patients,
                json!({"id": "p-1"}),
                None,
                1,
            )
            .await
            .unwrap();

        let updated = queue
            .update(&id, OperationPatch::failure(1, "503 unavailable"))
            .await
            .unwrap();
        assert_eq!(updated.retry_count, 1);
        assert_eq!(
            queue.get(&id).await.unwrap().unwrap().last_error.as_deref(),
            Some("503 unavailable")
        );

        assert!(queue.remove(&id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
        assert!(matches!(
            queue.update(&id, OperationPatch::default()).await,
            Err(Error::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn record_scoped_helpers() {
        let queue = open_queue().await;
        queue
            .enqueue(
                OperationKind::Create,
                Table::Patients,
                json!({"id": "temp_1_a"}),
                Some("op-1".into()),
                1,
            )
            .await
            .unwrap();
        queue
            .enqueue(
                OperationKind::Create,
                Table::Appointments,
                json!({"id": "temp_2_b", "patient_id": "temp_1_a"}),
                Some("op-2".into()),
                2,
            )
            .await
            .unwrap();

        assert_eq!(
            queue
                .pending_for_record(Table::Patients, "temp_1_a")
                .await
                .unwrap()
                .len(),
            1
        );

        let rewritten = queue
            .rewrite_record_id(Table::Patients, "temp_1_a", "srv-1")
            .await
            .unwrap();
        assert_eq!(rewritten, 2);

        let patient_op = queue.get("op-1").await.unwrap().unwrap();
        assert_eq!(patient_op.record_id, "srv-1");
        assert_eq!(patient_op.data["id"], "srv-1");

        let appointment_op = queue.get("op-2").await.unwrap().unwrap();
        assert_eq!(appointment_op.record_id, "temp_2_b");
        assert_eq!(appointment_op.data["patient_id"], "srv-1");

        assert_eq!(
            queue.remove_for_record(Table::Patients, "srv-1").await.unwrap(),
            1
        );
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_count_every_operation() {
        let queue = open_queue().await;
        assert_eq!(queue.stats().await.unwrap(), StoreStats::default());

        queue
            .enqueue(OperationKind::Delete, Table::Clinics, json!({"id": "c"}), None, 1)
            .await
            .unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.item_count, 1);
        assert!(stats.storage_size > 0);
    }
}
