//! Record types for storing entity data.

use crate::{RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Prefix of client-generated placeholder ids.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Generate a placeholder id for a record created while offline.
///
/// Format: `temp_<timestamp>_<rand>`.
pub fn temp_id(now: Timestamp) -> RecordId {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{TEMP_ID_PREFIX}{now}_{}", &suffix[..9])
}

/// Check whether an id is a client-generated placeholder.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// A persisted entity record.
///
/// `synced == false` means `data` holds a local edit the remote has not
/// confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord<T> {
    /// Server id or temp id
    pub id: RecordId,
    /// The entity payload
    pub data: T,
    /// When the record was first written locally (milliseconds since epoch)
    pub timestamp: Timestamp,
    /// Incremented on every local modification
    pub version: Version,
    /// Whether the remote has confirmed this value
    pub synced: bool,
    /// When `data` last changed (milliseconds since epoch)
    pub last_modified: Timestamp,
}

impl<T> StoredRecord<T> {
    /// A record holding a local edit the remote has not seen.
    pub fn local(id: impl Into<RecordId>, data: T, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            data,
            timestamp: now,
            version: 1,
            synced: false,
            last_modified: now,
        }
    }

    /// A record whose value the remote has confirmed.
    pub fn synced(id: impl Into<RecordId>, data: T, now: Timestamp) -> Self {
        Self {
            synced: true,
            ..Self::local(id, data, now)
        }
    }

    /// Replace the payload with a local edit.
    pub fn update_data(&mut self, data: T, now: Timestamp) {
        self.data = data;
        self.version += 1;
        self.synced = false;
        self.last_modified = now;
    }

    /// Mark the current payload as confirmed by the remote.
    pub fn mark_synced(&mut self) {
        self.synced = true;
    }

    /// Whether this record still carries a placeholder id.
    pub fn has_temp_id(&self) -> bool {
        is_temp_id(&self.id)
    }

    /// Convert the payload, keeping the bookkeeping fields.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<StoredRecord<U>, E> {
        Ok(StoredRecord {
            id: self.id,
            data: f(self.data)?,
            timestamp: self.timestamp,
            version: self.version,
            synced: self.synced,
            last_modified: self.last_modified,
        })
    }
}
