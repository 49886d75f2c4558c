//! Remote data API.
//!
//! The engine talks to the server through [`RemoteApi`]: generic per-table
//! row operations plus a delta query. [`HttpRemote`] implements it over the
//! REST surface served by `harbor-server`.

use crate::{record::TEMP_ID_PREFIX, Clock, SystemClock, Table, Timestamp};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a remote.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The request never produced a response (DNS, refused, timeout, ...)
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be understood
    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether retrying the same request cannot succeed.
    ///
    /// Client errors are permanent, except request timeouts and rate limits.
    pub fn is_permanent(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            RemoteError::Network(_) | RemoteError::Decode(_) => false,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Generic per-table access to the authoritative data store.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Insert a row and return it as stored (with its server id).
    async fn insert(&self, table: Table, row: &Value) -> RemoteResult<Value>;

    /// Patch a row and return it as stored.
    async fn update(&self, table: Table, id: &str, patch: &Value) -> RemoteResult<Value>;

    /// Delete a row.
    async fn delete(&self, table: Table, id: &str) -> RemoteResult<()>;

    /// Rows whose `updated_at` is strictly greater than `since`, or every row.
    async fn query_since(&self, table: Table, since: Option<Timestamp>) -> RemoteResult<Vec<Value>>;
}

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
}

/// [`RemoteApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Create a client for a server base URL such as `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    /// Create a client reusing an existing `reqwest::Client`.
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn rows_url(&self, table: Table) -> String {
        format!("{}/tables/{}/rows", self.base_url, table)
    }

    fn row_url(&self, table: Table, id: &str) -> String {
        format!("{}/{}", self.rows_url(table), urlencoding::encode(id))
    }

    async fn check(response: reqwest::Response) -> RemoteResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.details.or(b.error))
            .unwrap_or(body);
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> RemoteResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

fn network(err: reqwest::Error) -> RemoteError {
    RemoteError::Network(err.to_string())
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn insert(&self, table: Table, row: &Value) -> RemoteResult<Value> {
        let response = self
            .client
            .post(self.rows_url(table))
            .json(row)
            .send()
            .await
            .map_err(network)?;
        Self::json(Self::check(response).await?).await
    }

    async fn update(&self, table: Table, id: &str, patch: &Value) -> RemoteResult<Value> {
        let response = self
            .client
            .patch(self.row_url(table, id))
            .json(patch)
            .send()
            .await
            .map_err(network)?;
        Self::json(Self::check(response).await?).await
    }

    async fn delete(&self, table: Table, id: &str) -> RemoteResult<()> {
        let response = self
            .client
            .delete(self.row_url(table, id))
            .send()
            .await
            .map_err(network)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn query_since(&self, table: Table, since: Option<Timestamp>) -> RemoteResult<Vec<Value>> {
        let mut request = self.client.get(self.rows_url(table));
        if let Some(since) = since {
            request = request.query(&[("updatedAfter", since)]);
        }
        let response = request.send().await.map_err(network)?;
        Self::json(Self::check(response).await?).await
    }
}

/// An in-process [`RemoteApi`] holding rows in memory.
///
/// Behaves like `harbor-server`: inserts assign a server id to rows without
/// one (or with a temp id), every write stamps `updated_at`, and deletes are
/// hard. A failure can be injected to simulate an unreachable or rejecting
/// server.
pub struct MemoryRemote {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<Table, BTreeMap<String, Value>>,
    failure: Option<RemoteError>,
    requests: u64,
    next_id: u64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Stamp `updated_at` from the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following request fail with `failure`, or succeed again with `None`.
    pub fn set_failure(&self, failure: Option<RemoteError>) {
        self.state().failure = failure;
    }

    /// Requests received so far, failed ones included.
    pub fn request_count(&self) -> u64 {
        self.state().requests
    }

    /// Write a row directly, as another client would.
    pub fn put_row(&self, table: Table, mut row: Value) -> Value {
        let now = self.clock.now_millis();
        let mut state = self.state();
        let id = match row.get("id").and_then(Value::as_str) {
            Some(id) if !id.starts_with(TEMP_ID_PREFIX) => id.to_string(),
            _ => {
                state.next_id += 1;
                format!("srv_{}", state.next_id)
            }
        };
        if let Some(object) = row.as_object_mut() {
            object.insert("id".into(), Value::String(id.clone()));
            object.insert("updated_at".into(), Value::from(now));
        }
        state.tables.entry(table).or_default().insert(id, row.clone());
        row
    }

    /// A stored row.
    pub fn row(&self, table: Table, id: &str) -> Option<Value> {
        self.state().tables.get(&table)?.get(id).cloned()
    }

    /// Every stored row of a table, ordered by id.
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state()
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn begin(&self) -> RemoteResult<()> {
        let mut state = self.state();
        state.requests += 1;
        match &state.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn insert(&self, table: Table, row: &Value) -> RemoteResult<Value> {
        self.begin()?;
        if !row.is_object() {
            return Err(RemoteError::Status {
                status: 400,
                message: "row must be a JSON object".into(),
            });
        }
        Ok(self.put_row(table, row.clone()))
    }

    async fn update(&self, table: Table, id: &str, patch: &Value) -> RemoteResult<Value> {
        self.begin()?;
        let Some(mut row) = self.row(table, id) else {
            return Err(RemoteError::Status {
                status: 404,
                message: format!("{table}/{id} not found"),
            });
        };
        if let (Some(row), Some(patch)) = (row.as_object_mut(), patch.as_object()) {
            row.extend(patch.clone());
        }
        if let Some(object) = row.as_object_mut() {
            object.insert("id".into(), Value::String(id.to_string()));
        }
        Ok(self.put_row(table, row))
    }

    async fn delete(&self, table: Table, id: &str) -> RemoteResult<()> {
        self.begin()?;
        if let Some(rows) = self.state().tables.get_mut(&table) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn query_since(&self, table: Table, since: Option<Timestamp>) -> RemoteResult<Vec<Value>> {
        self.begin()?;
        Ok(self
            .rows(table)
            .into_iter()
            .filter(|row| match since {
                Some(since) => row
                    .get("updated_at")
                    .and_then(Value::as_i64)
                    .is_some_and(|updated_at| updated_at > since),
                None => true,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_classification() {
        let status = |status| RemoteError::Status {
            status,
            message: String::new(),
        };
        assert!(status(400).is_permanent());
        assert!(status(404).is_permanent());
        assert!(status(422).is_permanent());
        assert!(!status(408).is_permanent());
        assert!(!status(429).is_permanent());
        assert!(!status(500).is_permanent());
        assert!(!status(503).is_permanent());
        assert!(!RemoteError::Network("refused".into()).is_permanent());
    }

    #[test]
    fn urls() {
        let remote = HttpRemote::new("http://localhost:3000/").unwrap();
        assert_eq!(
            remote.rows_url(Table::Patients),
            "http://localhost:3000/tables/patients/rows"
        );
        assert_eq!(
            remote.row_url(Table::Clinics, "a b/c"),
            "http://localhost:3000/tables/clinics/rows/a%20b%2Fc"
        );
        assert_eq!(
            remote.row_url(Table::Clinics, "日本"),
            "http://localhost:3000/tables/clinics/rows/%E6%97%A5%E6%9C%AC"
        );
    }

    #[test]
    fn error_display() {
        let err = RemoteError::Status {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "HTTP 503: unavailable");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let remote = HttpRemote::new("http://127.0.0.1:9").unwrap();
        let err = remote.query_since(Table::Patients, None).await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
    }

    #[tokio::test]
    async fn memory_remote_assigns_server_ids() {
        let clock = Arc::new(crate::ManualClock::new(1_000));
        let remote = MemoryRemote::with_clock(clock.clone());

        let row = remote
            .insert(Table::Patients, &serde_json::json!({"id": "temp_1_abc", "name": "Ann"}))
            .await
            .unwrap();
        assert_eq!(row["id"], "srv_1");
        assert_eq!(row["updated_at"], 1_000);

        clock.advance(10);
        let updated = remote
            .update(Table::Patients, "srv_1", &serde_json::json!({"name": "Anne"}))
            .await
            .unwrap();
        assert_eq!(updated["name"], "Anne");
        assert_eq!(updated["updated_at"], 1_010);

        assert_eq!(remote.query_since(Table::Patients, Some(1_000)).await.unwrap().len(), 1);
        assert!(remote.query_since(Table::Patients, Some(1_010)).await.unwrap().is_empty());

        remote.delete(Table::Patients, "srv_1").await.unwrap();
        assert!(remote.rows(Table::Patients).is_empty());
    }

    #[tokio::test]
    async fn memory_remote_failure_injection() {
        let remote = MemoryRemote::new();
        remote.set_failure(Some(RemoteError::Network("down".into())));
        assert!(remote.query_since(Table::Clinics, None).await.is_err());

        remote.set_failure(None);
        assert!(remote.query_since(Table::Clinics, None).await.is_ok());
        assert_eq!(remote.request_count(), 2);

        let err = remote
            .update(Table::Clinics, "missing", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
