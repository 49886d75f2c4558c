//! Network status monitor.
//!
//! The host application reports connectivity changes (or lets
//! [`NetworkMonitor::check`] measure them); the sync engine subscribes and
//! reacts to offline → online transitions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Coarse connection quality, derived from check latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Poor,
    Fair,
    Good,
}

impl ConnectionQuality {
    /// Classify a round-trip latency.
    pub fn from_latency(latency: Duration) -> Self {
        match latency.as_millis() {
            0..=300 => ConnectionQuality::Good,
            301..=1000 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

/// A point-in-time connectivity reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub online: bool,
    pub quality: ConnectionQuality,
}

impl NetworkStatus {
    pub fn online() -> Self {
        Self {
            online: true,
            quality: ConnectionQuality::Unknown,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }
}

/// Shared connectivity signal.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    sender: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    /// Create a monitor with an initial reading.
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Current reading.
    pub fn status(&self) -> NetworkStatus {
        *self.sender.borrow()
    }

    /// Whether the client is currently online.
    pub fn is_online(&self) -> bool {
        self.status().online
    }

    /// Report a connectivity change.
    pub fn set_online(&self, online: bool) {
        self.update(NetworkStatus {
            online,
            quality: if online {
                self.status().quality
            } else {
                ConnectionQuality::Unknown
            },
        });
    }

    /// Replace the current reading. Subscribers are only woken on change.
    pub fn update(&self, status: NetworkStatus) {
        self.sender.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.online != status.online {
                tracing::info!(
                    "Network is now {}",
                    if status.online { "online" } else { "offline" }
                );
            }
            *current = status;
            true
        });
    }

    /// Receive every reading change.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.sender.subscribe()
    }

    /// Request a URL and update the reading from the outcome.
    ///
    /// Any HTTP response counts as online; transport failures count as offline.
    pub async fn check(&self, client: &reqwest::Client, url: &str) -> NetworkStatus {
        let started = Instant::now();
        let status = match client.head(url).send().await {
            Ok(_) => NetworkStatus {
                online: true,
                quality: ConnectionQuality::from_latency(started.elapsed()),
            },
            Err(err) => {
                tracing::debug!("Connectivity check to {} failed: {}", url, err);
                NetworkStatus::offline()
            }
        };
        self.update(status);
        status
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::online())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_from_latency() {
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(50)),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_millis(700)),
            ConnectionQuality::Fair
        );
        assert_eq!(
            ConnectionQuality::from_latency(Duration::from_secs(3)),
            ConnectionQuality::Poor
        );
    }

    #[test]
    fn set_online_updates_status() {
        let monitor = NetworkMonitor::new(NetworkStatus::offline());
        assert!(!monitor.is_online());

        monitor.set_online(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let monitor = NetworkMonitor::new(NetworkStatus::offline());
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().online);
    }

    #[tokio::test]
    async fn unchanged_reading_does_not_notify() {
        let monitor = NetworkMonitor::new(NetworkStatus::online());
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn failed_check_goes_offline() {
        let monitor = NetworkMonitor::default();
        let client = reqwest::Client::new();

        // Port 9 (discard) on localhost is not expected to serve HTTP.
        let status = monitor.check(&client, "http://127.0.0.1:9/").await;
        assert!(!status.online);
        assert!(!monitor.is_online());
    }
}
