//! Shared setup for integration tests.

#![allow(dead_code)]

use harbor_engine::{ManualClock, MemoryRemote, NetworkMonitor, OfflineStorage, SyncConfig};
use std::sync::Arc;
use std::time::Duration;

pub const START: i64 = 1_706_745_600_000;

pub struct TestClient {
    pub storage: OfflineStorage,
    pub remote: Arc<MemoryRemote>,
    pub network: NetworkMonitor,
    pub clock: Arc<ManualClock>,
}

/// A client on a private in-memory database talking to an in-process remote.
pub async fn client(online: bool) -> TestClient {
    client_with(online, SyncConfig::in_memory().with_sync_on_reconnect(false)).await
}

pub async fn client_with(online: bool, config: SyncConfig) -> TestClient {
    let clock = Arc::new(ManualClock::new(START));
    let remote = Arc::new(MemoryRemote::with_clock(clock.clone()));
    let network = NetworkMonitor::default();
    network.set_online(online);

    let storage = OfflineStorage::open_with_clock(
        config.with_push_delay(Duration::ZERO),
        remote.clone(),
        network.clone(),
        clock.clone(),
    )
    .await
    .expect("open storage");

    TestClient {
        storage,
        remote,
        network,
        clock,
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
