//! Error types for the Harbor engine.

use crate::{OperationId, RecordId};
use thiserror::Error;

/// All possible errors from the Harbor engine.
#[derive(Debug, Error)]
pub enum Error {
    // Lifecycle errors
    #[error("record store not initialized: call init() first")]
    NotInitialized,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema upgrade failed: {0}")]
    Migration(String),

    // Lookup errors
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("record not found: {table}/{id}")]
    RecordNotFound { table: String, id: RecordId },

    #[error("sync operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("sync conflict not found: {0}")]
    ConflictNotFound(String),

    // Payload errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Remote errors
    #[error("remote error: {0}")]
    Remote(#[from] crate::remote::RemoteError),

    #[error("client is offline")]
    Offline,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
