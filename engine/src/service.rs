//! The caller-facing surface.
//!
//! [`OfflineStorage`] owns one record store, its queue and a sync engine.
//! Per-table [`EntityService`]s write optimistically: online writes go to
//! the remote first and are stored as synced, anything else is stored
//! locally and queued for the next sync.

use crate::{
    config::SyncConfig,
    conflict::{ConflictResolver, Resolution, SyncConflict},
    engine::{SyncEngine, SyncEvent, SyncResult},
    error::Result,
    models::{Appointment, Clinic, Patient, Treatment},
    record::{is_temp_id, temp_id},
    schema::{Entity, IndexQuery},
    size::{self, DetailedStorageStats, StorageStats},
    snapshot::{self, StorageSnapshot},
    store::{decode_entity, with_id},
    Clock, Error, HttpRemote, NetworkMonitor, OperationId, OperationKind, RecordStore, RemoteApi,
    StoredRecord, SyncOperation, SyncQueue, SystemClock, Table,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Offline-first storage: local records, pending mutations and sync.
pub struct OfflineStorage {
    store: Arc<RecordStore>,
    queue: SyncQueue,
    remote: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    clock: Arc<dyn Clock>,
    engine: Arc<SyncEngine>,
    resolver: ConflictResolver,
}

impl OfflineStorage {
    /// Open the local database and start the background tasks the
    /// configuration asks for. Must be called from within a Tokio runtime.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
    ) -> Result<Self> {
        Self::open_with_clock(config, remote, network, Arc::new(SystemClock)).await
    }

    /// Like [`open`](Self::open), talking to the HTTP remote at
    /// `config.remote_url`.
    pub async fn connect(config: SyncConfig, network: NetworkMonitor) -> Result<Self> {
        let url = config
            .remote_url
            .clone()
            .ok_or_else(|| Error::InvalidInput("no remote URL configured".into()))?;
        let remote = HttpRemote::new(url)?;
        Self::open(config, Arc::new(remote), network).await
    }

    pub async fn open_with_clock(
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(RecordStore::new(config.database_url.clone()));
        store.init().await?;

        let queue = SyncQueue::new(store.clone());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue.clone(),
            remote.clone(),
            network.clone(),
            clock.clone(),
            &config,
        ));
        let resolver = ConflictResolver::new(store.clone(), queue.clone(), clock.clone());

        if config.sync_on_reconnect {
            engine.spawn_reconnect_listener();
        }
        if let Some(interval) = config.auto_sync_interval {
            engine.start_auto_sync(interval);
        }

        tracing::info!("Offline storage ready at {}", config.database_url);
        Ok(Self {
            store,
            queue,
            remote,
            network,
            clock,
            engine,
            resolver,
        })
    }

    /// Stop background tasks and close the database.
    pub async fn close(&self) {
        self.engine.shutdown();
        self.store.close().await;
        tracing::info!("Offline storage closed");
    }

    pub fn record_store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Insert or replace a record.
    pub async fn store(&self, table: Table, record: &StoredRecord<Value>) -> Result<()> {
        self.store.put(table, record).await
    }

    pub async fn retrieve(&self, table: Table, id: &str) -> Result<Option<StoredRecord<Value>>> {
        self.store.get(table, id).await
    }

    pub async fn retrieve_all(
        &self,
        table: Table,
        index: &IndexQuery,
    ) -> Result<Vec<StoredRecord<Value>>> {
        self.store.get_all(table, index).await
    }

    pub async fn remove(&self, table: Table, id: &str) -> Result<bool> {
        self.store.delete(table, id).await
    }

    pub async fn clear(&self, table: Table) -> Result<()> {
        self.store.clear(table).await
    }

    /// Records carrying a local edit the remote has not confirmed.
    pub async fn get_unsynced_data(&self, table: Table) -> Result<Vec<StoredRecord<Value>>> {
        self.store.get_all(table, &IndexQuery::Synced(false)).await
    }

    // ------------------------------------------------------------------
    // Queue and sync
    // ------------------------------------------------------------------

    pub async fn add_to_sync_queue(
        &self,
        kind: OperationKind,
        table: Table,
        data: Value,
    ) -> Result<OperationId> {
        self.queue
            .enqueue(kind, table, data, None, self.clock.now_millis())
            .await
    }

    pub async fn get_sync_queue(&self) -> Result<Vec<SyncOperation>> {
        self.queue.list().await
    }

    /// Sync now. Fails without touching the remote while offline.
    pub async fn trigger_sync(&self) -> SyncResult {
        if !self.network.is_online() {
            return SyncResult::failed(Error::Offline.to_string());
        }
        self.engine.sync_all().await
    }

    pub fn start_auto_sync(&self, interval: Duration) {
        self.engine.start_auto_sync(interval);
    }

    pub fn stop_auto_sync(&self) {
        self.engine.stop_auto_sync();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Totals across the domain tables and the sync queue.
    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        Ok(self.get_detailed_storage_stats().await?.totals)
    }

    pub async fn get_detailed_storage_stats(&self) -> Result<DetailedStorageStats> {
        let mut detailed = DetailedStorageStats::default();
        for table in Table::ALL {
            let stats = self.store.get_store_stats(table).await?;
            detailed.totals.total_items += stats.item_count;
            detailed.totals.unsynced_items += stats.unsynced_count;
            detailed.totals.storage_size += stats.storage_size;
            detailed.partitions.insert(table.to_string(), stats);
            detailed
                .last_sync
                .insert(table.to_string(), self.store.last_sync(table).await?);
        }

        detailed.sync_queue = self.queue.stats().await?;
        detailed.totals.sync_queue_size = detailed.sync_queue.item_count;
        detailed.totals.storage_size += detailed.sync_queue.storage_size;
        detailed.pending_conflicts = self.store.list_conflicts().await?.len() as u64;
        Ok(detailed)
    }

    /// Human-readable byte count (`0 B`, `512.0 B`, `1.5 KB`, ...).
    pub fn format_storage_size(bytes: u64) -> String {
        size::format_storage_size(bytes)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    pub async fn get_sync_conflicts(&self) -> Result<Vec<SyncConflict>> {
        self.store.list_conflicts().await
    }

    pub async fn resolve_sync_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        merged: Option<Value>,
    ) -> Result<Value> {
        self.resolver.resolve(conflict_id, resolution, merged).await
    }

    pub async fn resolve_all_sync_conflicts(&self, resolution: Resolution) -> Result<usize> {
        self.resolver.resolve_all(resolution).await
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub async fn export_snapshot(&self) -> Result<StorageSnapshot> {
        snapshot::export(&self.store, &self.queue, self.clock.now_millis()).await
    }

    /// Replace all local state with a snapshot.
    pub async fn import_snapshot(&self, snapshot: &StorageSnapshot) -> Result<()> {
        snapshot::import(&self.store, snapshot).await
    }

    // ------------------------------------------------------------------
    // Entity services
    // ------------------------------------------------------------------

    pub fn entity<E: Entity>(&self) -> EntityService<E> {
        EntityService {
            store: self.store.clone(),
            queue: self.queue.clone(),
            remote: self.remote.clone(),
            network: self.network.clone(),
            clock: self.clock.clone(),
            engine: self.engine.clone(),
            _entity: PhantomData,
        }
    }

    pub fn patients(&self) -> EntityService<Patient> {
        self.entity()
    }

    pub fn appointments(&self) -> EntityService<Appointment> {
        self.entity()
    }

    pub fn treatments(&self) -> EntityService<Treatment> {
        self.entity()
    }

    pub fn clinics(&self) -> EntityService<Clinic> {
        self.entity()
    }
}

/// Typed CRUD over one table with optimistic offline writes.
pub struct EntityService<E> {
    store: Arc<RecordStore>,
    queue: SyncQueue,
    remote: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    clock: Arc<dyn Clock>,
    engine: Arc<SyncEngine>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityService<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
            remote: self.remote.clone(),
            network: self.network.clone(),
            clock: self.clock.clone(),
            engine: self.engine.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> EntityService<E> {
    /// Create a record.
    ///
    /// Online, the remote assigns the id and the record is stored synced.
    /// Offline or on remote failure, the record keeps its own id (or gets a
    /// temp id) and a create operation is queued.
    pub async fn create(&self, entity: E) -> Result<StoredRecord<E>> {
        let (data, given_id) = payload(&entity)?;

        if self.network.is_online() {
            let outgoing = match &given_id {
                Some(id) => with_id(data.clone(), id)?,
                None => data.clone(),
            };
            match self.remote.insert(E::TABLE, &outgoing).await {
                Ok(row) => match row.get("id").and_then(Value::as_str).map(str::to_string) {
                    Some(id) => {
                        let record = StoredRecord::synced(id, row, self.clock.now_millis());
                        self.store.put(E::TABLE, &record).await?;
                        return decode_entity(record);
                    }
                    None => tracing::warn!("Remote returned a {} row without id", E::TABLE),
                },
                Err(e) => tracing::warn!("Remote create on {} failed, queueing: {}", E::TABLE, e),
            }
        }

        let now = self.clock.now_millis();
        let id = given_id.unwrap_or_else(|| temp_id(now));
        let record = StoredRecord::local(id.clone(), data.clone(), now);
        self.store.put(E::TABLE, &record).await?;
        self.queue
            .enqueue(OperationKind::Create, E::TABLE, with_id(data, &id)?, None, now)
            .await?;
        decode_entity(record)
    }

    /// Replace a record's payload.
    pub async fn update(&self, id: &str, entity: E) -> Result<StoredRecord<E>> {
        let id = self.store.resolve_id(E::TABLE, id).await?;
        let mut record = self
            .store
            .get(E::TABLE, &id)
            .await?
            .ok_or_else(|| Error::RecordNotFound {
                table: E::TABLE.to_string(),
                id: id.clone(),
            })?;
        let (data, _) = payload(&entity)?;

        // Queued mutations go first; writing around them would reorder.
        if self.can_write_through(&id).await? {
            match self.remote.update(E::TABLE, &id, &data).await {
                Ok(row) => {
                    let now = self.clock.now_millis();
                    record.update_data(row, now);
                    record.mark_synced();
                    self.store.put(E::TABLE, &record).await?;
                    return decode_entity(record);
                }
                Err(e) => tracing::warn!("Remote update of {}/{} failed, queueing: {}", E::TABLE, id, e),
            }
        }

        let now = self.clock.now_millis();
        record.update_data(data.clone(), now);
        self.store.put(E::TABLE, &record).await?;
        self.queue
            .enqueue(OperationKind::Update, E::TABLE, with_id(data, &id)?, None, now)
            .await?;
        decode_entity(record)
    }

    /// Delete a record. Returns whether it existed locally.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = self.store.resolve_id(E::TABLE, id).await?;
        if self.store.get(E::TABLE, &id).await?.is_none() {
            return Ok(false);
        }

        // Never reached the remote: forget it entirely.
        if is_temp_id(&id) {
            self.queue.remove_for_record(E::TABLE, &id).await?;
            self.store.delete(E::TABLE, &id).await?;
            return Ok(true);
        }

        if self.can_write_through(&id).await? {
            match self.remote.delete(E::TABLE, &id).await {
                Ok(()) => {
                    self.store.delete(E::TABLE, &id).await?;
                    return Ok(true);
                }
                Err(e) => tracing::warn!("Remote delete of {}/{} failed, queueing: {}", E::TABLE, id, e),
            }
        }

        // The delete supersedes any queued edit of the record.
        self.queue.remove_for_record(E::TABLE, &id).await?;
        let mut tombstone = serde_json::Map::new();
        tombstone.insert("id".into(), Value::String(id.clone()));
        self.queue
            .enqueue(
                OperationKind::Delete,
                E::TABLE,
                Value::Object(tombstone),
                None,
                self.clock.now_millis(),
            )
            .await?;
        self.store.delete(E::TABLE, &id).await?;
        Ok(true)
    }

    /// Get a record, refreshing the table from the remote first when online.
    pub async fn get(&self, id: &str) -> Result<Option<StoredRecord<E>>> {
        self.refresh().await;
        let id = self.store.resolve_id(E::TABLE, id).await?;
        self.store.get_entity(&id).await
    }

    /// Every record of the table.
    pub async fn list(&self) -> Result<Vec<StoredRecord<E>>> {
        self.refresh().await;
        self.store.get_all_entities(&IndexQuery::All).await
    }

    /// Records owned by a clinic.
    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<StoredRecord<E>>> {
        if E::TABLE.owner_field().is_none() {
            return Err(Error::InvalidInput(format!("{} records have no owner", E::TABLE)));
        }
        self.refresh().await;
        self.store
            .get_all_entities(&IndexQuery::OwnerId(owner_id.to_string()))
            .await
    }

    /// Local records grouped by owner.
    pub async fn count_by_owner(&self) -> Result<BTreeMap<String, usize>> {
        let Some(field) = E::TABLE.owner_field() else {
            return Ok(BTreeMap::new());
        };
        let mut counts = BTreeMap::new();
        for record in self.store.get_all(E::TABLE, &IndexQuery::All).await? {
            if let Some(owner) = record.data.get(field).and_then(Value::as_str) {
                *counts.entry(owner.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Pull the table when online. Failures only mean the local copy is served.
    async fn refresh(&self) {
        if !self.network.is_online() {
            return;
        }
        let result = self.engine.refresh(E::TABLE).await;
        if result.failed_count > 0 {
            tracing::debug!(
                "Serving local {} after refresh failed: {:?}",
                E::TABLE,
                result.errors
            );
        }
    }

    async fn can_write_through(&self, id: &str) -> Result<bool> {
        Ok(self.network.is_online()
            && self
                .queue
                .pending_for_record(E::TABLE, id)
                .await?
                .is_empty())
    }
}

/// An entity's stored payload, split from the id it names (if non-empty).
fn payload<E: Entity>(entity: &E) -> Result<(Value, Option<String>)> {
    let mut data = serde_json::to_value(entity)?;
    let object = data.as_object_mut().ok_or_else(|| {
        Error::InvalidPayload(format!("{} payload must be a JSON object", E::TABLE))
    })?;
    let id = match object.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id),
        _ => None,
    };
    Ok((data, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, MemoryRemote, RemoteError};

    async fn open(online: bool) -> (OfflineStorage, Arc<MemoryRemote>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = Arc::new(MemoryRemote::with_clock(clock.clone()));
        let network = NetworkMonitor::default();
        network.set_online(online);
        let config = SyncConfig::in_memory()
            .with_push_delay(Duration::ZERO)
            .with_sync_on_reconnect(false);
        let storage = OfflineStorage::open_with_clock(config, remote.clone(), network, clock)
            .await
            .unwrap();
        (storage, remote)
    }

    #[tokio::test]
    async fn online_create_is_synced_with_server_id() {
        let (storage, remote) = open(true).await;
        let record = storage
            .patients()
            .create(Patient::new("c-1").with("name", "Ann"))
            .await
            .unwrap();

        assert_eq!(record.id, "srv_1");
        assert!(record.synced);
        assert_eq!(record.data.id, "srv_1");
        assert!(storage.get_sync_queue().await.unwrap().is_empty());
        assert!(remote.row(Table::Patients, "srv_1").is_some());
    }

    #[tokio::test]
    async fn offline_create_gets_temp_id_and_queues() {
        let (storage, remote) = open(false).await;
        let record = storage
            .patients()
            .create(Patient::new("c-1").with("name", "Ann"))
            .await
            .unwrap();

        assert!(is_temp_id(&record.id));
        assert!(!record.synced);
        let queue = storage.get_sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, OperationKind::Create);
        assert_eq!(queue[0].record_id, record.id);
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn stored_payload_leaves_the_id_to_the_record() {
        let (storage, _) = open(false).await;
        let record = storage
            .clinics()
            .create(Clinic::default().with("name", "North"))
            .await
            .unwrap();
        assert_eq!(record.data.id, record.id);

        let stored = storage
            .retrieve(Table::Clinics, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.data, serde_json::json!({"name": "North"}));

        let queue = storage.get_sync_queue().await.unwrap();
        assert_eq!(queue[0].data["id"], record.id.as_str());
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_queue() {
        let (storage, remote) = open(true).await;
        remote.set_failure(Some(RemoteError::Network("timeout".into())));

        let record = storage
            .clinics()
            .create(Clinic::default().with("name", "North"))
            .await
            .unwrap();
        assert!(!record.synced);
        assert_eq!(storage.get_sync_queue().await.unwrap().len(), 1);

        // Reads fall back to the local copy.
        let clinics = storage.clinics().list().await.unwrap();
        assert_eq!(clinics.len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_offline() {
        let (storage, _) = open(false).await;
        let patients = storage.patients();
        storage
            .store(
                Table::Patients,
                &StoredRecord::synced("p-1", serde_json::json!({"id": "p-1", "clinic_id": "c-1"}), 1),
            )
            .await
            .unwrap();

        let updated = patients
            .update("p-1", Patient::new("c-1").with("name", "Bo"))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert!(!updated.synced);

        assert!(patients.delete("p-1").await.unwrap());
        assert!(patients.get("p-1").await.unwrap().is_none());

        let queue = storage.get_sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, OperationKind::Delete);
        assert!(!patients.delete("p-1").await.unwrap());
    }

    #[tokio::test]
    async fn deleting_unpushed_record_forgets_it() {
        let (storage, _) = open(false).await;
        let patients = storage.patients();
        let record = patients.create(Patient::new("c-1")).await.unwrap();

        assert!(patients.delete(&record.id).await.unwrap());
        assert!(storage.get_sync_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_of_missing_record() {
        let (storage, _) = open(false).await;
        let err = storage
            .patients()
            .update("nope", Patient::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn list_by_owner_reads_the_index() {
        let (storage, remote) = open(true).await;
        remote.put_row(Table::Patients, serde_json::json!({"id": "p-1", "clinic_id": "c-1"}));
        remote.put_row(Table::Patients, serde_json::json!({"id": "p-2", "clinic_id": "c-2"}));

        let owned = storage.patients().list_by_owner("c-1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, "p-1");
        assert!(storage.clinics().list_by_owner("c-1").await.is_err());

        let counts = storage.patients().count_by_owner().await.unwrap();
        assert_eq!(counts.get("c-2"), Some(&1));
    }

    #[tokio::test]
    async fn trigger_sync_offline_fails_fast() {
        let (storage, remote) = open(false).await;
        let result = storage.trigger_sync().await;
        assert!(!result.success);
        assert!(result.errors[0].contains("offline"));
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn close_makes_calls_fail() {
        let (storage, _) = open(false).await;
        storage.close().await;
        let err = storage.retrieve(Table::Clinics, "c-1").await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }
}
