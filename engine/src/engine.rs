//! The sync engine: push the queue, pull remote deltas, schedule both.
//!
//! A sync run is push followed by pull. Only one run executes at a time;
//! a caller that finds a run in progress gets an empty failed
//! [`SyncResult`] back immediately instead of waiting.

use crate::{
    config::SyncConfig,
    conflict::{self, SyncConflict},
    error::Result,
    record::is_temp_id,
    schema::IndexQuery,
    Clock, Error, NetworkMonitor, OperationKind, OperationPatch, OperationState, RecordStore,
    RemoteApi, StoredRecord, SyncOperation, SyncQueue, Table,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Outcome of a sync run (or of one of its phases).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub synced_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
    /// Conflicts detected while pulling
    pub conflicts: usize,
}

impl SyncResult {
    /// The result handed to a caller while another run is in progress.
    pub fn busy() -> Self {
        Self::default()
    }

    /// A run that could not start at all.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            synced_count: 0,
            failed_count: 1,
            errors: vec![error.into()],
            conflicts: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.success = self.failed_count == 0;
        self
    }

    fn merge(mut self, other: SyncResult) -> Self {
        self.synced_count += other.synced_count;
        self.failed_count += other.failed_count;
        self.errors.extend(other.errors);
        self.conflicts += other.conflicts;
        self.finish()
    }

    fn fail(&mut self, error: String) {
        self.failed_count += 1;
        self.errors.push(error);
    }
}

/// Notifications broadcast by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// An operation ran out of retries and was dropped from the queue.
    OperationAbandoned {
        operation: SyncOperation,
        error: String,
    },
    /// A pulled row diverged from an unpushed local edit.
    ConflictDetected(SyncConflict),
    /// A full sync run finished.
    SyncCompleted(SyncResult),
}

/// Capacity of the event channel; slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 64;

struct Inner {
    store: Arc<RecordStore>,
    queue: SyncQueue,
    remote: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    push_delay: Duration,
    fail_fast_on_permanent: bool,
    running: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

/// Clears the running latch when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Tasks {
    auto_sync: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

/// Drives push and pull against a [`RemoteApi`].
pub struct SyncEngine {
    inner: Arc<Inner>,
    tasks: Mutex<Tasks>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<RecordStore>,
        queue: SyncQueue,
        remote: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                queue,
                remote,
                network,
                clock,
                max_retries: config.max_retries.max(1),
                push_delay: config.push_delay,
                fail_fast_on_permanent: config.fail_fast_on_permanent,
                running: AtomicBool::new(false),
                events,
            }),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Whether a sync run is in progress.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Receive engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Push the queue, then pull every table.
    ///
    /// `success` is true only when neither phase reported a failure.
    pub async fn sync_all(&self) -> SyncResult {
        self.inner.sync_all().await
    }

    /// Push the queue only.
    pub async fn sync_queue(&self) -> SyncResult {
        let Some(_guard) = self.inner.try_start() else {
            return SyncResult::busy();
        };
        self.inner.push().await
    }

    /// Pull every table only.
    pub async fn pull_from_server(&self) -> SyncResult {
        let Some(_guard) = self.inner.try_start() else {
            return SyncResult::busy();
        };
        self.inner.pull().await
    }

    /// Pull a single table. Returns a busy result while another run is in
    /// progress.
    pub async fn refresh(&self, table: Table) -> SyncResult {
        let Some(_guard) = self.inner.try_start() else {
            return SyncResult::busy();
        };
        match self.inner.pull_table(table).await {
            Ok((synced_count, conflicts)) => SyncResult {
                synced_count,
                conflicts,
                ..SyncResult::default()
            }
            .finish(),
            Err(e) => SyncResult::failed(format!("pull {table}: {e}")),
        }
    }

    /// Run [`sync_all`](Self::sync_all) every `interval` while online and
    /// idle. Replaces a previously started timer. Must be called from
    /// within a Tokio runtime.
    pub fn start_auto_sync(&self, interval: Duration) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if inner.network.is_online() && !inner.running.load(Ordering::Acquire) {
                    tracing::debug!("Auto-sync tick");
                    inner.sync_all().await;
                }
            }
        });

        let mut tasks = self.tasks();
        if let Some(previous) = tasks.auto_sync.replace(handle) {
            previous.abort();
        }
        tracing::info!("Auto-sync started every {:?}", interval);
    }

    /// Stop the auto-sync timer. A run already in progress completes.
    pub fn stop_auto_sync(&self) {
        if let Some(handle) = self.tasks().auto_sync.take() {
            handle.abort();
            tracing::info!("Auto-sync stopped");
        }
    }

    /// Whether the auto-sync timer is running.
    pub fn auto_sync_active(&self) -> bool {
        self.tasks().auto_sync.is_some()
    }

    /// Run a sync every time the network goes from offline to online.
    /// Must be called from within a Tokio runtime.
    pub fn spawn_reconnect_listener(&self) {
        let inner = self.inner.clone();
        let mut status = inner.network.subscribe();
        let handle = tokio::spawn(async move {
            let mut was_online = status.borrow_and_update().online;
            while status.changed().await.is_ok() {
                let online = status.borrow_and_update().online;
                if online && !was_online {
                    tracing::info!("Back online, syncing");
                    inner.sync_all().await;
                }
                was_online = online;
            }
        });

        let mut tasks = self.tasks();
        if let Some(previous) = tasks.reconnect.replace(handle) {
            previous.abort();
        }
    }

    /// Abort every background task.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks();
        for handle in [tasks.auto_sync.take(), tasks.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn try_start(&self) -> Option<RunGuard<'_>> {
        match self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(RunGuard(&self.running)),
            Err(_) => {
                tracing::debug!("Sync already in progress");
                None
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn sync_all(&self) -> SyncResult {
        let Some(_guard) = self.try_start() else {
            return SyncResult::busy();
        };

        let push = self.push().await;
        let pull = self.pull().await;
        let result = push.merge(pull);

        tracing::info!(
            "Sync finished: {} synced, {} failed, {} conflicts",
            result.synced_count,
            result.failed_count,
            result.conflicts
        );
        self.emit(SyncEvent::SyncCompleted(result.clone()));
        result
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    async fn push(&self) -> SyncResult {
        let mut result = SyncResult::default();
        let ids: Vec<String> = match self.queue.list().await {
            Ok(operations) => operations.into_iter().map(|op| op.id).collect(),
            Err(e) => return SyncResult::failed(format!("failed to read sync queue: {e}")),
        };
        if ids.is_empty() {
            return result.finish();
        }

        // A record with an open conflict waits for its resolution, which
        // decides what (if anything) is pushed for it.
        let held: HashSet<(Table, String)> = match self.store.list_conflicts().await {
            Ok(conflicts) => conflicts
                .into_iter()
                .map(|conflict| (conflict.table, conflict.record_id))
                .collect(),
            Err(e) => return SyncResult::failed(format!("failed to read sync conflicts: {e}")),
        };
        tracing::debug!("Pushing {} operations", ids.len());

        for (i, id) in ids.iter().enumerate() {
            if i > 0 && !self.push_delay.is_zero() {
                tokio::time::sleep(self.push_delay).await;
            }

            // Reload: an earlier push may have rewritten this operation.
            let operation = match self.queue.get(id).await {
                Ok(Some(operation)) => operation,
                Ok(None) => continue,
                Err(e) => {
                    result.fail(format!("failed to read operation {id}: {e}"));
                    continue;
                }
            };
            if held.contains(&(operation.table, operation.record_id.clone())) {
                tracing::debug!(
                    "Holding {} {}/{} until its conflict is resolved",
                    operation.kind,
                    operation.table,
                    operation.record_id
                );
                continue;
            }

            match self.push_one(&operation).await {
                Ok(()) => result.synced_count += 1,
                Err(e) => {
                    result.fail(format!(
                        "{} {}/{}: {}",
                        operation.kind, operation.table, operation.record_id, e
                    ));
                    if let Err(e) = self.record_failure(operation, &e).await {
                        tracing::warn!("Failed to record push failure: {}", e);
                    }
                }
            }
        }

        result.finish()
    }

    async fn push_one(&self, operation: &SyncOperation) -> Result<()> {
        let table = operation.table;
        match operation.kind {
            OperationKind::Create => {
                let stored = self.remote.insert(table, &operation.data).await?;
                self.complete(operation).await?;

                let server_id = stored.get("id").and_then(Value::as_str);
                if let Some(server_id) = server_id {
                    if is_temp_id(&operation.record_id) && server_id != operation.record_id {
                        self.remap(table, &operation.record_id, server_id).await?;
                    }
                }
            }
            OperationKind::Update => {
                self.remote
                    .update(table, &operation.record_id, &operation.data)
                    .await?;
                self.complete(operation).await?;
            }
            OperationKind::Delete => {
                self.remote.delete(table, &operation.record_id).await?;
                self.complete(operation).await?;
            }
        }

        tracing::debug!(
            "Pushed {} {}/{}",
            operation.kind,
            operation.table,
            operation.record_id
        );
        Ok(())
    }

    /// Remove a pushed operation and mark its record synced unless more
    /// mutations for it are still queued.
    async fn complete(&self, operation: &SyncOperation) -> Result<()> {
        self.queue.remove(&operation.id).await?;
        if operation.kind == OperationKind::Delete {
            return Ok(());
        }

        let pending = self
            .queue
            .pending_for_record(operation.table, &operation.record_id)
            .await?;
        if pending.is_empty() {
            self.store
                .mark_synced(operation.table, &operation.record_id)
                .await?;
        }
        Ok(())
    }

    /// Move a record from its temp id to the id the server assigned.
    async fn remap(&self, table: Table, temp_id: &str, server_id: &str) -> Result<()> {
        self.store.rekey(table, temp_id, server_id).await?;
        self.queue.rewrite_record_id(table, temp_id, server_id).await?;

        for other in Table::ALL {
            for mut record in self
                .store
                .get_all(other, &IndexQuery::Synced(false))
                .await?
            {
                let mut changed = false;
                if let Some(object) = record.data.as_object_mut() {
                    for value in object.values_mut() {
                        if value.as_str() == Some(temp_id) {
                            *value = Value::String(server_id.to_string());
                            changed = true;
                        }
                    }
                }
                if changed {
                    self.store.put(other, &record).await?;
                }
            }
        }

        self.store
            .record_id_mapping(table, temp_id, server_id, self.clock.now_millis())
            .await?;
        tracing::info!("Mapped {}/{} to server id {}", table, temp_id, server_id);
        Ok(())
    }

    async fn record_failure(&self, mut operation: SyncOperation, error: &Error) -> Result<()> {
        let message = error.to_string();
        let permanent = matches!(error, Error::Remote(remote) if remote.is_permanent());

        let state = if permanent && self.fail_fast_on_permanent {
            operation.abandon(message.clone())
        } else {
            operation.record_failure(message.clone(), self.max_retries)
        };

        match state {
            OperationState::Pending { retry_count } => {
                tracing::warn!(
                    "Push of {} {}/{} failed (attempt {}/{}): {}",
                    operation.kind,
                    operation.table,
                    operation.record_id,
                    retry_count,
                    self.max_retries,
                    message
                );
                self.queue
                    .update(&operation.id, OperationPatch::failure(retry_count, message))
                    .await?;
            }
            OperationState::Abandoned {
                retry_count,
                last_error,
            } => {
                tracing::error!(
                    "Abandoning {} {}/{} after {} attempts: {}",
                    operation.kind,
                    operation.table,
                    operation.record_id,
                    retry_count,
                    last_error
                );
                self.queue.remove(&operation.id).await?;
                self.emit(SyncEvent::OperationAbandoned {
                    operation,
                    error: last_error,
                });
            }
            OperationState::Succeeded => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    async fn pull(&self) -> SyncResult {
        let mut result = SyncResult::default();
        for table in Table::ALL {
            match self.pull_table(table).await {
                Ok((written, conflicts)) => {
                    result.synced_count += written;
                    result.conflicts += conflicts;
                }
                Err(e) => {
                    tracing::warn!("Pull of {} failed: {}", table, e);
                    result.fail(format!("pull {table}: {e}"));
                }
            }
        }
        result.finish()
    }

    /// Pull one table. Returns the number of rows written and conflicts found.
    async fn pull_table(&self, table: Table) -> Result<(usize, usize)> {
        let since = self.store.last_sync(table).await?;
        // Taken before the query so rows written meanwhile are pulled next time.
        let checkpoint = self.clock.now_millis();
        let rows = self.remote.query_since(table, since).await?;

        let mut records = Vec::with_capacity(rows.len());
        let mut conflicts = 0;
        for row in rows {
            let Some(id) = row.get("id").and_then(Value::as_str).map(str::to_string) else {
                tracing::warn!("Skipping {} row without an id", table);
                continue;
            };

            let existing = self.store.get(table, &id).await?;
            match &existing {
                Some(local) if !local.synced => {
                    if let Some(found) = conflict::detect(table, local, &row, checkpoint) {
                        let stored = self.store.upsert_conflict(&found).await?;
                        tracing::warn!(
                            "Conflict on {}/{} in fields {:?}",
                            table,
                            id,
                            stored.conflict_fields
                        );
                        self.emit(SyncEvent::ConflictDetected(stored));
                        conflicts += 1;
                    }
                    // Identical to the local edit, which is still queued.
                    continue;
                }
                None => {
                    // Deleted locally, delete not pushed yet.
                    if !self.queue.pending_for_record(table, &id).await?.is_empty() {
                        continue;
                    }
                }
                Some(_) => {}
            }

            let mut record = StoredRecord::synced(id, row, checkpoint);
            if let Some(local) = existing {
                record.version = local.version + 1;
                record.timestamp = local.timestamp;
            }
            records.push(record);
        }

        self.store.put_many(table, &records).await?;
        self.store.set_last_sync(table, checkpoint).await?;
        if !records.is_empty() {
            tracing::debug!("Pulled {} rows into {}", records.len(), table);
        }
        Ok((records.len(), conflicts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConflictResolver, ManualClock, MemoryRemote, RemoteError, Resolution};
    use serde_json::json;

    struct Harness {
        store: Arc<RecordStore>,
        queue: SyncQueue,
        remote: Arc<MemoryRemote>,
        network: NetworkMonitor,
        clock: Arc<ManualClock>,
        engine: SyncEngine,
    }

    async fn harness(config: SyncConfig) -> Harness {
        let store = Arc::new(RecordStore::new("sqlite::memory:"));
        store.init().await.unwrap();
        let queue = SyncQueue::new(store.clone());
        let clock = Arc::new(ManualClock::new(1_000));
        let remote = Arc::new(MemoryRemote::with_clock(clock.clone()));
        let network = NetworkMonitor::default();
        let engine = SyncEngine::new(
            store.clone(),
            queue.clone(),
            remote.clone(),
            network.clone(),
            clock.clone(),
            &config.with_push_delay(Duration::ZERO),
        );
        Harness {
            store,
            queue,
            remote,
            network,
            clock,
            engine,
        }
    }

    async fn write_local(h: &Harness, table: Table, data: Value, kind: OperationKind) {
        let id = data["id"].as_str().unwrap().to_string();
        let now = h.clock.now_millis();
        h.store
            .put(table, &StoredRecord::local(id, data.clone(), now))
            .await
            .unwrap();
        h.queue.enqueue(kind, table, data, None, now).await.unwrap();
    }

    #[tokio::test]
    async fn push_marks_records_synced() {
        let h = harness(SyncConfig::in_memory()).await;
        write_local(
            &h,
            Table::Clinics,
            json!({"id": "c-1", "name": "North"}),
            OperationKind::Create,
        )
        .await;

        let result = h.engine.sync_queue().await;
        assert!(result.success);
        assert_eq!(result.synced_count, 1);
        assert!(h.queue.is_empty().await.unwrap());
        assert!(h.store.get(Table::Clinics, "c-1").await.unwrap().unwrap().synced);
        assert_eq!(h.remote.row(Table::Clinics, "c-1").unwrap()["name"], "North");
    }

    #[tokio::test]
    async fn later_pending_operation_keeps_record_dirty() {
        let h = harness(SyncConfig::in_memory()).await;
        write_local(&h, Table::Clinics, json!({"id": "c-1", "name": "A"}), OperationKind::Create)
            .await;
        h.queue
            .enqueue(
                OperationKind::Update,
                Table::Clinics,
                json!({"id": "c-1", "name": "B"}),
                None,
                1_000,
            )
            .await
            .unwrap();

        let op = h.queue.list().await.unwrap().remove(0);
        h.engine.inner.push_one(&op).await.unwrap();

        assert!(!h.store.get(Table::Clinics, "c-1").await.unwrap().unwrap().synced);
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failures_count_up_then_abandon() {
        let h = harness(SyncConfig::in_memory()).await;
        let mut events = h.engine.subscribe();
        write_local(&h, Table::Clinics, json!({"id": "c-1"}), OperationKind::Create).await;
        h.remote
            .set_failure(Some(RemoteError::Network("connection refused".into())));

        for attempt in 1..=2 {
            let result = h.engine.sync_queue().await;
            assert!(!result.success);
            assert_eq!(result.failed_count, 1);
            let op = h.queue.list().await.unwrap().remove(0);
            assert_eq!(op.retry_count, attempt);
            assert!(op.last_error.unwrap().contains("connection refused"));
        }

        h.engine.sync_queue().await;
        assert!(h.queue.is_empty().await.unwrap());
        assert!(!h.store.get(Table::Clinics, "c-1").await.unwrap().unwrap().synced);

        match events.recv().await.unwrap() {
            SyncEvent::OperationAbandoned { operation, .. } => {
                assert_eq!(operation.record_id, "c-1");
                assert_eq!(operation.retry_count, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_fast_abandons_rejected_operations() {
        let h = harness(SyncConfig::in_memory().with_fail_fast_on_permanent(true)).await;
        write_local(&h, Table::Clinics, json!({"id": "c-1"}), OperationKind::Update).await;

        // Updating a row the server never saw is a 404.
        let result = h.engine.sync_queue().await;
        assert_eq!(result.failed_count, 1);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn temp_ids_are_remapped() {
        let h = harness(SyncConfig::in_memory()).await;
        write_local(
            &h,
            Table::Patients,
            json!({"id": "temp_1000_abcdef012", "name": "Ann"}),
            OperationKind::Create,
        )
        .await;
        write_local(
            &h,
            Table::Appointments,
            json!({"id": "a-1", "patient_id": "temp_1000_abcdef012"}),
            OperationKind::Create,
        )
        .await;

        let result = h.engine.sync_queue().await;
        assert!(result.success, "{:?}", result.errors);

        assert!(h
            .store
            .get(Table::Patients, "temp_1000_abcdef012")
            .await
            .unwrap()
            .is_none());
        let patient = h.store.get(Table::Patients, "srv_1").await.unwrap().unwrap();
        assert!(patient.synced);
        assert_eq!(patient.data["id"], "srv_1");

        let remote_appointment = h.remote.row(Table::Appointments, "a-1").unwrap();
        assert_eq!(remote_appointment["patient_id"], "srv_1");
        assert_eq!(
            h.store
                .resolve_id(Table::Patients, "temp_1000_abcdef012")
                .await
                .unwrap(),
            "srv_1"
        );
    }

    #[tokio::test]
    async fn pull_writes_synced_rows_and_advances_checkpoint() {
        let h = harness(SyncConfig::in_memory()).await;
        h.remote.put_row(Table::Clinics, json!({"id": "c-1", "name": "North"}));
        h.clock.advance(100);

        let result = h.engine.pull_from_server().await;
        assert!(result.success);
        assert_eq!(result.synced_count, 1);
        assert_eq!(h.store.last_sync(Table::Clinics).await.unwrap(), Some(1_100));

        let record = h.store.get(Table::Clinics, "c-1").await.unwrap().unwrap();
        assert!(record.synced);

        // Nothing new since the checkpoint.
        let again = h.engine.pull_from_server().await;
        assert_eq!(again.synced_count, 0);
    }

    #[tokio::test]
    async fn pull_records_conflicts_instead_of_overwriting() {
        let h = harness(SyncConfig::in_memory()).await;
        let mut events = h.engine.subscribe();
        write_local(&h, Table::Clinics, json!({"id": "c-1", "name": "Local"}), OperationKind::Update)
            .await;
        h.remote.put_row(Table::Clinics, json!({"id": "c-1", "name": "Server"}));

        let result = h.engine.pull_from_server().await;
        assert_eq!(result.conflicts, 1);

        let record = h.store.get(Table::Clinics, "c-1").await.unwrap().unwrap();
        assert_eq!(record.data["name"], "Local");
        assert!(!record.synced);

        let conflicts = h.store.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_fields, vec!["name"]);
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::ConflictDetected(_)
        ));
    }

    /// Local edit whose push failed, then a pull that found the server moved on.
    async fn conflicted_edit(h: &Harness) -> String {
        write_local(h, Table::Clinics, json!({"id": "c-1", "name": "Local"}), OperationKind::Update)
            .await;
        h.remote.put_row(Table::Clinics, json!({"id": "c-1", "name": "Server"}));

        h.remote
            .set_failure(Some(RemoteError::Network("connection refused".into())));
        assert!(!h.engine.sync_queue().await.success);
        h.remote.set_failure(None);

        assert_eq!(h.engine.pull_from_server().await.conflicts, 1);
        h.store.list_conflicts().await.unwrap().remove(0).id
    }

    #[tokio::test]
    async fn open_conflict_holds_back_its_operations() {
        let h = harness(SyncConfig::in_memory()).await;
        let conflict_id = conflicted_edit(&h).await;
        let resolver = ConflictResolver::new(h.store.clone(), h.queue.clone(), h.clock.clone());

        let result = h.engine.sync_all().await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(h.remote.row(Table::Clinics, "c-1").unwrap()["name"], "Server");
        assert_eq!(h.queue.len().await.unwrap(), 1);
        assert_eq!(h.store.list_conflicts().await.unwrap().len(), 1);

        resolver
            .resolve(&conflict_id, Resolution::Server, None)
            .await
            .unwrap();
        h.engine.sync_all().await;

        let record = h.store.get(Table::Clinics, "c-1").await.unwrap().unwrap();
        let remote = h.remote.row(Table::Clinics, "c-1").unwrap();
        assert!(record.synced);
        assert_eq!(record.data["name"], remote["name"]);
        assert_eq!(remote["name"], "Server");
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn keeping_local_releases_the_held_operation() {
        let h = harness(SyncConfig::in_memory()).await;
        let conflict_id = conflicted_edit(&h).await;
        let resolver = ConflictResolver::new(h.store.clone(), h.queue.clone(), h.clock.clone());

        resolver
            .resolve(&conflict_id, Resolution::Local, None)
            .await
            .unwrap();
        let result = h.engine.sync_queue().await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.synced_count, 1);

        assert_eq!(h.remote.row(Table::Clinics, "c-1").unwrap()["name"], "Local");
        assert!(h.store.get(Table::Clinics, "c-1").await.unwrap().unwrap().synced);
        assert!(h.store.list_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pull_failures_are_collected_per_table() {
        let h = harness(SyncConfig::in_memory()).await;
        h.remote.set_failure(Some(RemoteError::Status {
            status: 503,
            message: "maintenance".into(),
        }));

        let result = h.engine.pull_from_server().await;
        assert!(!result.success);
        assert_eq!(result.failed_count, Table::ALL.len());
        assert!(result.errors[0].starts_with("pull patients"));
        assert_eq!(h.store.last_sync(Table::Patients).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected() {
        let h = harness(SyncConfig::in_memory()).await;
        let _guard = h.engine.inner.try_start().unwrap();

        assert!(h.engine.is_running());
        assert_eq!(h.engine.sync_all().await, SyncResult::busy());
        assert_eq!(h.remote.request_count(), 0);
    }

    #[tokio::test]
    async fn sync_all_combines_phases() {
        let h = harness(SyncConfig::in_memory()).await;
        write_local(&h, Table::Clinics, json!({"id": "c-1"}), OperationKind::Create).await;
        h.remote.put_row(Table::Patients, json!({"id": "p-1", "clinic_id": "c-1"}));

        let result = h.engine.sync_all().await;
        assert!(result.success);
        // One push plus the pulled patient and the echoed clinic.
        assert_eq!(result.synced_count, 3);
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn auto_sync_can_be_stopped() {
        let h = harness(SyncConfig::in_memory()).await;
        h.engine.start_auto_sync(Duration::from_millis(10));
        assert!(h.engine.auto_sync_active());

        h.engine.stop_auto_sync();
        assert!(!h.engine.auto_sync_active());
    }

    #[tokio::test]
    async fn reconnect_triggers_sync() {
        let h = harness(SyncConfig::in_memory()).await;
        h.network.set_online(false);
        h.engine.spawn_reconnect_listener();
        write_local(&h, Table::Clinics, json!({"id": "c-1"}), OperationKind::Create).await;

        h.network.set_online(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.queue.is_empty().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue drained after reconnect");
        assert!(h.remote.row(Table::Clinics, "c-1").is_some());
    }
}
