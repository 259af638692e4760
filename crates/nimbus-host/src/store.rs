//! Durable key/value store boundary.
//!
//! The host persists only small coordination records (its heartbeat). The
//! [`DurableStore`] trait is the seam for a real backend; [`InMemoryStore`]
//! backs tests and single-node deployments.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::RetryPolicy;

/// Store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A conditional write lost a race with another writer.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Conflicts resolve by re-reading and retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A stored value and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub value: Bytes,
    /// Incremented on every write, starting at 1.
    pub version: u64,
}

/// Durable key/value storage.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Writes `value` unless the key exists. Returns true if it was created.
    async fn create_if_not_exists(&self, key: &str, value: Bytes) -> Result<bool, StoreError>;

    /// Writes `value`. With `expected_version`, fails with
    /// [`StoreError::Conflict`] unless the stored version matches
    /// (0 meaning absent). Returns the new version.
    async fn write(
        &self,
        key: &str,
        value: Bytes,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn read(&self, key: &str) -> Result<Option<StoreRecord>, StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Deletes the key. Returns true if it existed.
    async fn delete_if_exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<String, StoreRecord>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn create_if_not_exists(&self, key: &str, value: Bytes) -> Result<bool, StoreError> {
        match self.records.entry(key.to_owned()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(StoreRecord { value, version: 1 });
                Ok(true)
            }
        }
    }

    async fn write(
        &self,
        key: &str,
        value: Bytes,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut record = self
            .records
            .entry(key.to_owned())
            .or_insert_with(|| StoreRecord {
                value: Bytes::new(),
                version: 0,
            });
        if let Some(expected) = expected_version {
            if record.version != expected {
                let actual = record.version;
                drop(record);
                self.records.remove_if(key, |_, r| r.version == 0);
                return Err(StoreError::Conflict {
                    key: key.to_owned(),
                    expected,
                    actual,
                });
            }
        }
        record.version += 1;
        record.value = value;
        Ok(record.version)
    }

    async fn read(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| r.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_if_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(key).is_some())
    }
}

/// Periodically records that this host is alive.
#[derive(Clone)]
pub struct HeartbeatWriter {
    store: Arc<dyn DurableStore>,
    host_id: String,
    retry: RetryPolicy,
}

impl HeartbeatWriter {
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>, host_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            host_id: host_id.into(),
            retry,
        }
    }

    /// Key under which this host's heartbeat is stored.
    #[must_use]
    pub fn key(&self) -> String {
        format!("hosts/{}/heartbeat", self.host_id)
    }

    /// Writes one heartbeat (milliseconds since the epoch), retrying
    /// version conflicts.
    pub async fn beat(&self) -> Result<u64, StoreError> {
        let key = self.key();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));

        let store = &self.store;
        let key = key.as_str();
        self.retry
            .retry(
                "heartbeat",
                move |_| async move {
                    let current = store.read(key).await?.map_or(0, |r| r.version);
                    store
                        .write(key, Bytes::from(now.to_string()), Some(current))
                        .await
                },
                StoreError::is_transient,
            )
            .await
    }

    /// Beats every `interval` until `cancel` fires, then deletes the record.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.beat().await {
                        Ok(version) => debug!(host_id = %self.host_id, version, "Heartbeat written"),
                        Err(e) => warn!(host_id = %self.host_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
        if let Err(e) = self.store.delete_if_exists(&self.key()).await {
            warn!(host_id = %self.host_id, error = %e, "Failed to remove heartbeat");
        }
    }
}
