//! Divergent edits and how they are settled.
//!
//! A conflict is recorded when a pulled row would overwrite a record that
//! still carries an unpushed local edit. The local record is left alone
//! until the conflict is resolved by keeping the local value, taking the
//! server value, or merging the two.

use crate::{
    error::Result,
    schema::Table,
    store::with_id,
    Clock, Error, OperationKind, OperationPatch, RecordId, RecordStore, StoredRecord, SyncQueue,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Fields never compared when looking for divergence. The id is the
/// record key, which local payloads need not repeat.
const IGNORED_FIELDS: &[&str] = &["id", "updated_at"];

/// A local edit and a server row that disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    pub table: Table,
    pub record_id: RecordId,
    pub local_data: Value,
    pub server_data: Value,
    /// Fields whose values differ, sorted
    pub conflict_fields: Vec<String>,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local value and push it
    Local,
    /// Take the server value
    Server,
    /// Server value overlaid with a merge payload
    Merge,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::Local => "local",
            Resolution::Server => "server",
            Resolution::Merge => "merge",
        })
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Resolution::Local),
            "server" => Ok(Resolution::Server),
            "merge" => Ok(Resolution::Merge),
            other => Err(Error::InvalidInput(format!("unknown resolution: {other}"))),
        }
    }
}

/// Fields whose values differ between two payloads.
///
/// A field present on one side only counts as differing. Non-object
/// payloads are compared whole and report no field names.
pub fn diff_fields(local: &Value, incoming: &Value) -> Vec<String> {
    let (Some(local), Some(incoming)) = (local.as_object(), incoming.as_object()) else {
        return Vec::new();
    };

    let keys: BTreeSet<&String> = local.keys().chain(incoming.keys()).collect();
    keys.into_iter()
        .filter(|key| !IGNORED_FIELDS.contains(&key.as_str()))
        .filter(|key| local.get(*key) != incoming.get(*key))
        .cloned()
        .collect()
}

/// Decide whether an incoming server row conflicts with the local record.
///
/// Only a record with an unpushed local edit (`synced == false`) can
/// conflict, and only if at least one compared field differs.
pub fn detect(
    table: Table,
    local: &StoredRecord<Value>,
    incoming: &Value,
    now: Timestamp,
) -> Option<SyncConflict> {
    if local.synced {
        return None;
    }

    let conflict_fields = diff_fields(&local.data, incoming);
    if conflict_fields.is_empty() {
        return None;
    }

    Some(SyncConflict {
        id: uuid::Uuid::new_v4().to_string(),
        table,
        record_id: local.id.clone(),
        local_data: local.data.clone(),
        server_data: incoming.clone(),
        conflict_fields,
        timestamp: now,
        last_modified_by: incoming
            .get("last_modified_by")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Compute the resolved payload of a conflict.
///
/// `Merge` overlays `merged` on the server value. Without a merge payload
/// the local values of the conflicting fields are overlaid instead.
pub fn resolved_value(
    conflict: &SyncConflict,
    resolution: Resolution,
    merged: Option<&Value>,
) -> Result<Value> {
    match resolution {
        Resolution::Local => Ok(conflict.local_data.clone()),
        Resolution::Server => Ok(conflict.server_data.clone()),
        Resolution::Merge => {
            let mut base = conflict
                .server_data
                .as_object()
                .cloned()
                .unwrap_or_default();

            let overlay: Map<String, Value> = match merged {
                Some(Value::Object(merged)) => merged.clone(),
                Some(other) => {
                    return Err(Error::InvalidPayload(format!(
                        "merge payload must be a JSON object, got {other}"
                    )))
                }
                None => conflict
                    .conflict_fields
                    .iter()
                    .filter_map(|field| {
                        conflict
                            .local_data
                            .get(field)
                            .map(|value| (field.clone(), value.clone()))
                    })
                    .collect(),
            };

            base.extend(overlay);
            Ok(Value::Object(base))
        }
    }
}

struct ConflictRow(SyncConflict);

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> std::result::Result<T, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ConflictRow {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let table: String = row.try_get("table_name")?;

        Ok(ConflictRow(SyncConflict {
            id: row.try_get("id")?,
            table: table.parse().map_err(|e: Error| sqlx::Error::ColumnDecode {
                index: "table_name".to_string(),
                source: Box::new(e),
            })?,
            record_id: row.try_get("record_id")?,
            local_data: decode_json("local_data", row.try_get::<&str, _>("local_data")?)?,
            server_data: decode_json("server_data", row.try_get::<&str, _>("server_data")?)?,
            conflict_fields: decode_json(
                "conflict_fields",
                row.try_get::<&str, _>("conflict_fields")?,
            )?,
            timestamp: row.try_get("timestamp")?,
            last_modified_by: row.try_get("last_modified_by")?,
        }))
    }
}

const SELECT_CONFLICTS: &str = "SELECT id, table_name, record_id, local_data, server_data, \
                                conflict_fields, timestamp, last_modified_by FROM sync_conflicts";

impl RecordStore {
    /// Every unresolved conflict, oldest first.
    pub async fn list_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let pool = self.pool().await?;
        let rows = sqlx::query_as::<_, ConflictRow>(&format!(
            "{SELECT_CONFLICTS} ORDER BY timestamp, rowid"
        ))
        .fetch_all(&pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    /// Get a conflict by id.
    pub async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>> {
        let pool = self.pool().await?;
        let row = sqlx::query_as::<_, ConflictRow>(&format!("{SELECT_CONFLICTS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&pool)
            .await?;
        Ok(row.map(|row| row.0))
    }

    /// Persist a conflict. A record has at most one open conflict: a newer
    /// divergence replaces the older one but keeps its id.
    pub async fn upsert_conflict(&self, conflict: &SyncConflict) -> Result<SyncConflict> {
        let pool = self.pool().await?;
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM sync_conflicts WHERE table_name = ?1 AND record_id = ?2",
        )
        .bind(conflict.table.as_str())
        .bind(&conflict.record_id)
        .fetch_optional(&pool)
        .await?;

        let mut conflict = conflict.clone();
        if let Some(id) = existing {
            conflict.id = id;
        }

        Self::write_conflict_with(&pool, &conflict).await?;
        Ok(conflict)
    }

    pub(crate) async fn write_conflict_with<'e, X>(executor: X, conflict: &SyncConflict) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO sync_conflicts
                (id, table_name, record_id, local_data, server_data, conflict_fields,
                 timestamp, last_modified_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                local_data = excluded.local_data,
                server_data = excluded.server_data,
                conflict_fields = excluded.conflict_fields,
                timestamp = excluded.timestamp,
                last_modified_by = excluded.last_modified_by",
        )
        .bind(&conflict.id)
        .bind(conflict.table.as_str())
        .bind(&conflict.record_id)
        .bind(serde_json::to_string(&conflict.local_data)?)
        .bind(serde_json::to_string(&conflict.server_data)?)
        .bind(serde_json::to_string(&conflict.conflict_fields)?)
        .bind(conflict.timestamp)
        .bind(&conflict.last_modified_by)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Delete a conflict. Returns whether it existed.
    pub async fn remove_conflict(&self, id: &str) -> Result<bool> {
        let pool = self.pool().await?;
        let result = sqlx::query("DELETE FROM sync_conflicts WHERE id = ?1")
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop every conflict.
    pub async fn clear_conflicts(&self) -> Result<()> {
        let pool = self.pool().await?;
        Self::clear_conflicts_with(&pool).await
    }

    pub(crate) async fn clear_conflicts_with<'e, X>(executor: X) -> Result<()>
    where
        X: sqlx::SqliteExecutor<'e>,
    {
        sqlx::query("DELETE FROM sync_conflicts")
            .execute(executor)
            .await?;
        Ok(())
    }
}

/// Applies resolutions and writes the outcome back to the record store.
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<RecordStore>,
    queue: SyncQueue,
    clock: Arc<dyn Clock>,
}

impl ConflictResolver {
    pub fn new(store: Arc<RecordStore>, queue: SyncQueue, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            queue,
            clock,
        }
    }

    /// Resolve one conflict and return the value that was written.
    ///
    /// The conflict is removed only after the resolved record is stored, so
    /// a failed write leaves it pending.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        merged: Option<Value>,
    ) -> Result<Value> {
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

        let value = resolved_value(&conflict, resolution, merged.as_ref())?;

        match resolution {
            Resolution::Server => self.accept_server(&conflict, value.clone()).await?,
            Resolution::Local | Resolution::Merge => {
                self.keep_local(&conflict, value.clone()).await?
            }
        }

        self.store.remove_conflict(&conflict.id).await?;
        tracing::info!(
            "Resolved conflict on {}/{} with {}",
            conflict.table,
            conflict.record_id,
            resolution
        );
        Ok(value)
    }

    /// Apply one resolution to every pending conflict. Returns how many were
    /// resolved. `Merge` needs a per-record payload and is rejected.
    pub async fn resolve_all(&self, resolution: Resolution) -> Result<usize> {
        if resolution == Resolution::Merge {
            return Err(Error::InvalidInput(
                "merge cannot be applied to all conflicts at once".into(),
            ));
        }

        let conflicts = self.store.list_conflicts().await?;
        for conflict in &conflicts {
            self.resolve(&conflict.id, resolution, None).await?;
        }
        Ok(conflicts.len())
    }

    /// The server value is authoritative: store it as synced and drop any
    /// local mutation still waiting for the record.
    async fn accept_server(&self, conflict: &SyncConflict, value: Value) -> Result<()> {
        let now = self.clock.now_millis();
        let mut record = StoredRecord::synced(conflict.record_id.clone(), value, now);
        if let Some(existing) = self.store.get(conflict.table, &conflict.record_id).await? {
            record.version = existing.version + 1;
            record.timestamp = existing.timestamp;
        }

        self.store.put(conflict.table, &record).await?;
        self.queue
            .remove_for_record(conflict.table, &conflict.record_id)
            .await?;
        Ok(())
    }

    /// The resolved value still has to reach the server: store it unsynced
    /// and make sure a queued mutation carries it.
    async fn keep_local(&self, conflict: &SyncConflict, value: Value) -> Result<()> {
        let now = self.clock.now_millis();
        let record = match self.store.get(conflict.table, &conflict.record_id).await? {
            Some(mut existing) => {
                existing.update_data(value.clone(), now);
                existing
            }
            None => StoredRecord::local(conflict.record_id.clone(), value.clone(), now),
        };
        self.store.put(conflict.table, &record).await?;

        let value = with_id(value, &conflict.record_id)?;
        let pending = self
            .queue
            .pending_for_record(conflict.table, &conflict.record_id)
            .await?;
        match pending
            .iter()
            .rev()
            .find(|op| op.kind != OperationKind::Delete)
        {
            Some(operation) => {
                self.queue
                    .update(&operation.id, OperationPatch::data(value))
                    .await?;
            }
            None => {
                self.queue
                    .enqueue(OperationKind::Update, conflict.table, value, None, now)
                    .await?;
            }
        }
        Ok(())
    }
}
