//! Sync operations: the pending mutations waiting to be pushed.
//!
//! An operation is a small state machine:
//!
//! ```text
//! Pending(n) ──push ok──────────────▶ Succeeded
//!     │
//!     └──push failed──▶ Pending(n + 1)   while n + 1 < max_retries
//!                  └──▶ Abandoned        once n + 1 == max_retries
//! ```
//!
//! Abandoned operations are removed from the queue and announced loudly;
//! the record they touched stays unsynced.

use crate::{error::Result, Error, OperationId, RecordId, Table, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(Error::InvalidPayload(format!(
                "unknown operation type: {other}"
            ))),
        }
    }
}

/// A pending mutation in the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation ID
    pub id: OperationId,
    /// Kind of mutation
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Target table
    pub table: Table,
    /// Record the mutation targets
    pub record_id: RecordId,
    /// Row sent to the remote (always an object carrying `id`)
    pub data: serde_json::Value,
    /// When the operation was enqueued
    pub timestamp: Timestamp,
    /// Failed push attempts so far
    pub retry_count: u32,
    /// Error of the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    /// Waiting in the queue after `retry_count` failed attempts.
    Pending { retry_count: u32 },
    /// Accepted by the remote.
    Succeeded,
    /// Dropped after exhausting its retries.
    Abandoned { retry_count: u32, last_error: String },
}

/// Partial update applied to a queued operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPatch {
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub data: Option<serde_json::Value>,
}

impl OperationPatch {
    /// Patch that records a failed attempt.
    pub fn failure(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            retry_count: Some(retry_count),
            last_error: Some(Some(error.into())),
            data: None,
        }
    }

    /// Patch that replaces the row sent to the remote.
    pub fn data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }
}

impl SyncOperation {
    /// Create a fresh operation.
    pub fn new(
        id: impl Into<OperationId>,
        kind: OperationKind,
        table: Table,
        record_id: impl Into<RecordId>,
        data: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            table,
            record_id: record_id.into(),
            data,
            timestamp,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Current state of a queued operation.
    pub fn state(&self) -> OperationState {
        OperationState::Pending {
            retry_count: self.retry_count,
        }
    }

    /// Record a failed push attempt and return the resulting state.
    ///
    /// `retry_count` is incremented by exactly one.
    pub fn record_failure(&mut self, error: impl Into<String>, max_retries: u32) -> OperationState {
        let error = error.into();
        self.retry_count += 1;
        self.last_error = Some(error.clone());

        if self.retry_count >= max_retries {
            OperationState::Abandoned {
                retry_count: self.retry_count,
                last_error: error,
            }
        } else {
            OperationState::Pending {
                retry_count: self.retry_count,
            }
        }
    }

    /// Mark the operation as unrecoverable regardless of its retry budget.
    pub fn abandon(&mut self, error: impl Into<String>) -> OperationState {
        let error = error.into();
        self.retry_count += 1;
        self.last_error = Some(error.clone());
        OperationState::Abandoned {
            retry_count: self.retry_count,
            last_error: error,
        }
    }

    /// Apply a partial update.
    pub fn apply(&mut self, patch: OperationPatch) {
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(last_error) = patch.last_error {
            self.last_error = last_error;
        }
        if let Some(data) = patch.data {
            self.data = data;
        }
    }
}
