//! Remote Payload Store
//!
//! The encrypted payload is pulled and pushed with optimistic concurrency:
//! every push names the version it was based on, and the store refuses the
//! write if its stored version has moved on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{Result, WalletError};

/// An encrypted payload and the version the store holds it at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePayload {
    /// Serialized envelope
    pub payload: String,
    pub version: u64,
}

#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn pull(&self, guid: &Uuid) -> Result<RemotePayload>;

    /// Store `payload` if the remote is still at `expected_version`.
    /// Returns the new version.
    async fn push(
        &self,
        guid: &Uuid,
        payload: &str,
        checksum: &str,
        expected_version: u64,
    ) -> Result<u64>;
}

/// Run `op`, retrying transient failures with backoff
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed ({}), retrying in {:?} (attempt {}/{})",
                    operation, e, delay, attempt, policy.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Payload store with retry applied
#[derive(Clone)]
pub struct RemoteSyncClient {
    store: Arc<dyn PayloadStore>,
    retry: RetryPolicy,
}

impl RemoteSyncClient {
    pub fn new(store: Arc<dyn PayloadStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn pull(&self, guid: &Uuid) -> Result<RemotePayload> {
        let remote = with_retry(&self.retry, "payload pull", || self.store.pull(guid)).await?;
        debug!("Pulled payload version {}", remote.version);
        Ok(remote)
    }

    pub async fn push(&self, guid: &Uuid, payload: &str, checksum: &str, expected_version: u64) -> Result<u64> {
        let result = with_retry(&self.retry, "payload push", || {
            self.store.push(guid, payload, checksum, expected_version)
        })
        .await;

        match &result {
            Ok(version) => info!("Pushed payload version {}", version),
            Err(WalletError::VersionConflict { expected, actual }) => warn!(
                "Payload push rejected: based on version {}, remote has {:?}",
                expected, actual
            ),
            Err(_) => {}
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    payload: String,
    version: u64,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    payload: &'a str,
    checksum: &'a str,
    version: u64,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: u64,
}

/// HTTP payload store (`GET`/`POST {base}/wallet/{guid}`)
pub struct HttpPayloadStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPayloadStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WalletError::network_fatal(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, guid: &Uuid) -> String {
        format!("{}/wallet/{}", self.base_url, guid)
    }
}

fn status_error(what: &str, status: reqwest::StatusCode) -> WalletError {
    WalletError::Network {
        message: format!("{} returned HTTP {}", what, status),
        transient: status.is_server_error(),
    }
}

#[async_trait]
impl PayloadStore for HttpPayloadStore {
    async fn pull(&self, guid: &Uuid) -> Result<RemotePayload> {
        let response = self.client.get(self.url(guid)).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(WalletError::Validation(format!("no payload stored for wallet {}", guid)));
        }
        if !status.is_success() {
            return Err(status_error("payload pull", status));
        }

        let body: PullResponse = response.json().await?;
        Ok(RemotePayload {
            payload: body.payload,
            version: body.version,
        })
    }

    async fn push(
        &self,
        guid: &Uuid,
        payload: &str,
        checksum: &str,
        expected_version: u64,
    ) -> Result<u64> {
        let response = self
            .client
            .post(self.url(guid))
            .json(&PushRequest {
                payload,
                checksum,
                version: expected_version,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            let actual = response.json::<VersionResponse>().await.ok().map(|v| v.version);
            return Err(WalletError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }
        if !status.is_success() {
            return Err(status_error("payload push", status));
        }

        Ok(response.json::<VersionResponse>().await?.version)
    }
}

#[derive(Default)]
struct MemoryStoreState {
    payloads: HashMap<Uuid, RemotePayload>,
    failures: Vec<WalletError>,
}

/// In-memory payload store enforcing the same version and checksum rules as
/// the remote.
#[derive(Default)]
pub struct MemoryPayloadStore {
    state: Mutex<MemoryStoreState>,
    pushes: AtomicUsize,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the store currently holds
    pub fn stored(&self, guid: &Uuid) -> Option<RemotePayload> {
        self.state().payloads.get(guid).cloned()
    }

    /// Overwrite stored state directly, as another device would
    pub fn put(&self, guid: Uuid, payload: RemotePayload) {
        self.state().payloads.insert(guid, payload);
    }

    /// Fail the next pull or push with `error`
    pub fn fail_next(&self, error: WalletError) {
        self.state().failures.push(error);
    }

    /// Accepted pushes
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn pull(&self, guid: &Uuid) -> Result<RemotePayload> {
        let mut state = self.state();
        if let Some(error) = state.failures.pop() {
            return Err(error);
        }
        state
            .payloads
            .get(guid)
            .cloned()
            .ok_or_else(|| WalletError::Validation(format!("no payload stored for wallet {}", guid)))
    }

    async fn push(
        &self,
        guid: &Uuid,
        payload: &str,
        checksum: &str,
        expected_version: u64,
    ) -> Result<u64> {
        let mut state = self.state();
        if let Some(error) = state.failures.pop() {
            return Err(error);
        }
        if hex::encode(Sha256::digest(payload.as_bytes())) != checksum {
            return Err(WalletError::Validation("payload checksum mismatch".into()));
        }

        let current = state.payloads.get(guid).map(|p| p.version);
        if current.unwrap_or(0) != expected_version {
            return Err(WalletError::VersionConflict {
                expected: expected_version,
                actual: current,
            });
        }

        let version = expected_version + 1;
        state.payloads.insert(
            *guid,
            RemotePayload {
                payload: payload.to_string(),
                version,
            },
        );
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum(payload: &str) -> String {
        hex::encode(Sha256::digest(payload.as_bytes()))
    }

    #[tokio::test]
    async fn test_versions_advance() {
        let store = MemoryPayloadStore::new();
        let guid = Uuid::new_v4();

        assert_eq!(store.push(&guid, "a", &checksum("a"), 0).await.unwrap(), 1);
        assert_eq!(store.push(&guid, "b", &checksum("b"), 1).await.unwrap(), 2);

        let pulled = store.pull(&guid).await.unwrap();
        assert_eq!(pulled.payload, "b");
        assert_eq!(pulled.version, 2);
    }

    #[tokio::test]
    async fn test_stale_push_conflicts_without_overwriting() {
        let store = MemoryPayloadStore::new();
        let guid = Uuid::new_v4();
        store.push(&guid, "a", &checksum("a"), 0).await.unwrap();
        store.push(&guid, "b", &checksum("b"), 1).await.unwrap();

        let result = store.push(&guid, "stale", &checksum("stale"), 1).await;
        assert!(matches!(
            result,
            Err(WalletError::VersionConflict {
                expected: 1,
                actual: Some(2)
            })
        ));
        assert_eq!(store.stored(&guid).unwrap().payload, "b");
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let store = MemoryPayloadStore::new();
        let guid = Uuid::new_v4();
        assert!(matches!(
            store.push(&guid, "a", &checksum("b"), 0).await,
            Err(WalletError::Validation(_))
        ));
        assert!(store.stored(&guid).is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryPayloadStore::new());
        let guid = Uuid::new_v4();
        store.push(&guid, "a", &checksum("a"), 0).await.unwrap();
        store.fail_next(WalletError::network("HTTP 503"));

        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        let client = RemoteSyncClient::new(store, policy);
        assert_eq!(client.pull(&guid).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_fatal_failures_are_not_retried() {
        let store = Arc::new(MemoryPayloadStore::new());
        let guid = Uuid::new_v4();
        store.push(&guid, "a", &checksum("a"), 0).await.unwrap();
        store.fail_next(WalletError::network_fatal("HTTP 403"));

        let client = RemoteSyncClient::new(store, RetryPolicy::default());
        assert!(client.pull(&guid).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        let mut calls = 0;
        let result: Result<()> = with_retry(&policy, "test", || {
            calls += 1;
            async { Err(WalletError::network("timeout")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
