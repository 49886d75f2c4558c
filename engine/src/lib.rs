//! # Harbor Engine
//!
//! Offline-first durable storage and synchronization for client applications.
//!
//! Records live in a local SQLite database and are usable with or without a
//! connection. Every local mutation the remote has not confirmed is kept in
//! a durable queue; the sync engine pushes that queue and pulls remote
//! changes whenever the client is online.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`StoredRecord`] wraps a JSON payload with:
//! - A server id or a temp id (`temp_<timestamp>_<rand>`) for records created offline
//! - A version bumped on every local edit
//! - A `synced` flag, false while a local edit is unconfirmed
//!
//! Records are kept per [`Table`]. Typed payloads implement [`Entity`].
//!
//! ### Sync Operations
//!
//! Mutations that could not reach the remote become [`SyncOperation`]s in the
//! [`SyncQueue`]. Each one is pushed until it succeeds or runs out of retries.
//!
//! ### Conflicts
//!
//! A pulled row that disagrees with an unpushed local edit becomes a
//! [`SyncConflict`] instead of overwriting it. The [`ConflictResolver`]
//! settles it by [`Resolution`]: keep local, take server, or merge.
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor_engine::{MemoryRemote, NetworkMonitor, OfflineStorage, Patient, SyncConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> harbor_engine::Result<()> {
//! let network = NetworkMonitor::default();
//! network.set_online(false);
//!
//! let storage = OfflineStorage::open(
//!     SyncConfig::in_memory().with_sync_on_reconnect(false),
//!     Arc::new(MemoryRemote::new()),
//!     network.clone(),
//! )
//! .await?;
//!
//! // Offline: stored locally under a temp id and queued.
//! let patient = storage
//!     .patients()
//!     .create(Patient::new("clinic-1").with("name", "Alice"))
//!     .await?;
//! assert!(!patient.synced);
//! assert_eq!(storage.get_sync_queue().await?.len(), 1);
//!
//! // Online again: push, then pull.
//! network.set_online(true);
//! let result = storage.trigger_sync().await;
//! assert!(result.success);
//! assert!(storage.get_sync_queue().await?.is_empty());
//! # storage.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! Use [`OfflineStorage::export_snapshot`] and [`OfflineStorage::import_snapshot`]
//! with [`StorageSnapshot`] for backups. Snapshots serialize to JSON with
//! deterministic ordering.

pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod models;
pub mod network;
pub mod operation;
pub mod queue;
pub mod record;
pub mod remote;
pub mod schema;
pub mod service;
pub mod size;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use conflict::{ConflictResolver, Resolution, SyncConflict};
pub use engine::{SyncEngine, SyncEvent, SyncResult};
pub use error::{Error, Result};
pub use models::{Appointment, Clinic, Patient, Treatment};
pub use network::{ConnectionQuality, NetworkMonitor, NetworkStatus};
pub use operation::{OperationKind, OperationPatch, OperationState, SyncOperation};
pub use queue::SyncQueue;
pub use record::{is_temp_id, temp_id, StoredRecord};
pub use remote::{HttpRemote, MemoryRemote, RemoteApi, RemoteError, RemoteResult};
pub use schema::{Entity, IndexQuery, Table};
pub use service::{EntityService, OfflineStorage};
pub use size::{
    calculate_object_size, format_storage_size, ByteSize, DetailedStorageStats, StorageStats,
    StoreStats,
};
pub use snapshot::{SnapshotMetadata, StorageSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::RecordStore;

/// Type aliases for clarity
pub type RecordId = String;
pub type OperationId = String;
pub type Version = i64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;
