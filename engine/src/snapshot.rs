//! Storage snapshots for backup and device migration.
//!
//! A snapshot holds every partition of a [`RecordStore`]. Maps are
//! `BTreeMap`s so the same store always serializes to the same JSON.

use crate::{
    conflict::SyncConflict,
    error::Result,
    schema::{IndexQuery, SCHEMA_VERSION},
    Error, RecordId, RecordStore, StoredRecord, SyncOperation, SyncQueue, Table, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of every partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Database schema version at export time
    pub schema_version: i64,
    pub exported_at: Timestamp,
    /// Records by table, then by record id
    pub tables: BTreeMap<Table, BTreeMap<RecordId, StoredRecord<Value>>>,
    /// Pending operations in queue order
    pub sync_queue: Vec<SyncOperation>,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    /// Settings, pull checkpoints included
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl StorageSnapshot {
    /// Create an empty snapshot.
    pub fn new(exported_at: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version: SCHEMA_VERSION,
            exported_at,
            tables: BTreeMap::new(),
            sync_queue: Vec::new(),
            conflicts: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn add_record(&mut self, table: Table, record: StoredRecord<Value>) {
        self.tables
            .entry(table)
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn get_record(&self, table: Table, id: &str) -> Option<&StoredRecord<Value>> {
        self.tables.get(&table)?.get(id)
    }

    /// Count records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Check that the snapshot can be imported as-is.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if self.schema_version > SCHEMA_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot schema version {} is newer than {}",
                self.schema_version, SCHEMA_VERSION
            )));
        }

        for (table, records) in &self.tables {
            for (id, record) in records {
                if *id != record.id {
                    return Err(Error::InvalidSnapshot(format!(
                        "{table}/{id} holds record {}",
                        record.id
                    )));
                }
                if !record.data.is_object() {
                    return Err(Error::InvalidSnapshot(format!(
                        "{table}/{id} payload is not an object"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub schema_version: i64,
    pub exported_at: Timestamp,
    pub record_count: usize,
    pub pending_count: usize,
    pub conflict_count: usize,
}

impl From<&StorageSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StorageSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            exported_at: snapshot.exported_at,
            record_count: snapshot.record_count(),
            pending_count: snapshot.sync_queue.len(),
            conflict_count: snapshot.conflicts.len(),
        }
    }
}

/// Copy every partition into a snapshot.
pub async fn export(
    store: &RecordStore,
    queue: &SyncQueue,
    now: Timestamp,
) -> Result<StorageSnapshot> {
    let mut snapshot = StorageSnapshot::new(now);
    for table in Table::ALL {
        for record in store.get_all(table, &IndexQuery::All).await? {
            snapshot.add_record(table, record);
        }
    }
    snapshot.sync_queue = queue.list().await?;
    snapshot.conflicts = store.list_conflicts().await?;
    snapshot.settings = store.all_settings().await?.into_iter().collect();

    tracing::info!(
        "Exported snapshot: {} records, {} pending operations",
        snapshot.record_count(),
        snapshot.sync_queue.len()
    );
    Ok(snapshot)
}

/// Replace every partition with the snapshot's contents.
///
/// The snapshot is validated before anything is cleared, and the whole
/// replacement runs in one transaction: a failed import leaves the store
/// as it was.
pub async fn import(store: &RecordStore, snapshot: &StorageSnapshot) -> Result<()> {
    snapshot.validate()?;

    let pool = store.pool().await?;
    let mut tx = pool.begin().await?;

    for table in Table::ALL {
        RecordStore::clear_with(&mut *tx, table).await?;
        if let Some(records) = snapshot.tables.get(&table) {
            for record in records.values() {
                RecordStore::put_with(&mut *tx, table, record).await?;
            }
        }
    }

    SyncQueue::clear_with(&mut *tx).await?;
    for operation in &snapshot.sync_queue {
        SyncQueue::insert_with(&mut *tx, operation).await?;
    }

    RecordStore::clear_conflicts_with(&mut *tx).await?;
    for conflict in &snapshot.conflicts {
        RecordStore::write_conflict_with(&mut *tx, conflict).await?;
    }

    RecordStore::clear_settings_with(&mut *tx).await?;
    for (key, value) in &snapshot.settings {
        RecordStore::put_setting_with(&mut *tx, key, value).await?;
    }

    tx.commit().await?;

    tracing::info!(
        "Imported snapshot: {} records, {} pending operations",
        snapshot.record_count(),
        snapshot.sync_queue.len()
    );
    Ok(())
}
