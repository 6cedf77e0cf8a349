//! Freshness arbitration between the local cache and the remote copy of one
//! logical entity.
//!
//! Decision precedence (see [`arbitrate`]):
//! 1. Neither side has data: empty sentinel (`cache`, `never`, not fresh)
//! 2. One side only: remote-only is fresh, cache-only is not
//! 3. Either timestamp malformed: remote, not fresh
//! 4. Both timestamps readable: strictly newer wins, a tie goes to remote
//! 5. A timestamp missing: `prefer_source`, else remote, not fresh
//!
//! Selection is wholesale. Fields are never merged across the two copies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fieldsync_core::{DataSource, Stamp, TimestampedEntity};

use crate::error::{RemoteError, SyncError};
use crate::observable::Unsubscribe;
use crate::store::{
    read_record_or_absent, write_record, ConnectivityOracle, LocalStore, RemoteStore,
};

/// Cached copy of an entity as stored under `cache/<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord<T> {
    pub data: T,
    pub timestamp: Stamp,
    pub source: DataSource,
}

/// Input to [`FreshnessArbiter::get_freshest_data`].
#[derive(Debug, Clone)]
pub struct FreshnessQuery<T> {
    pub cache_key: String,
    pub remote_data: Option<T>,
    /// RFC 3339 text or epoch milliseconds.
    pub remote_timestamp: Option<String>,
    pub prefer_source: Option<DataSource>,
}

impl<T> FreshnessQuery<T> {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            remote_data: None,
            remote_timestamp: None,
            prefer_source: None,
        }
    }

    pub fn with_remote(mut self, data: T, timestamp: Option<String>) -> Self {
        self.remote_data = Some(data);
        self.remote_timestamp = timestamp;
        self
    }

    pub fn prefer(mut self, source: DataSource) -> Self {
        self.prefer_source = Some(source);
        self
    }
}

/// Outcome of [`FreshnessArbiter::subscribe_to_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSubscription {
    Live,
    /// Not connected; no listener was opened.
    Offline,
    /// The remote refused the listener.
    Failed(String),
}

/// Pick the canonical copy. Never fails.
pub fn arbitrate<T>(
    remote: Option<(T, Stamp)>,
    cached: Option<(T, Stamp)>,
    prefer_source: Option<DataSource>,
) -> TimestampedEntity<T> {
    match (remote, cached) {
        (None, None) => TimestampedEntity::empty(),
        (Some((data, timestamp)), None) => pick(data, DataSource::Remote, timestamp, true),
        (None, Some((data, timestamp))) => pick(data, DataSource::Cache, timestamp, false),
        (Some((remote, remote_at)), Some((cached, cached_at))) => {
            match compare(&remote_at, &cached_at) {
                Comparison::Malformed => {
                    tracing::debug!(
                        remote = %remote_at,
                        cached = %cached_at,
                        "malformed timestamp; preferring remote"
                    );
                    pick(remote, DataSource::Remote, remote_at, false)
                }
                Comparison::RemoteWins => pick(remote, DataSource::Remote, remote_at, true),
                Comparison::CacheWins => pick(cached, DataSource::Cache, cached_at, true),
                Comparison::Missing => match prefer_source {
                    Some(DataSource::Cache) => pick(cached, DataSource::Cache, cached_at, false),
                    _ => pick(remote, DataSource::Remote, remote_at, false),
                },
            }
        }
    }
}

enum Comparison {
    Malformed,
    Missing,
    RemoteWins,
    CacheWins,
}

fn compare(remote: &Stamp, cached: &Stamp) -> Comparison {
    match (remote, cached) {
        (Stamp::Unparsed(_), _) | (_, Stamp::Unparsed(_)) => Comparison::Malformed,
        (Stamp::At(r), Stamp::At(c)) if r >= c => Comparison::RemoteWins,
        (Stamp::At(_), Stamp::At(_)) => Comparison::CacheWins,
        _ => Comparison::Missing,
    }
}

fn pick<T>(data: T, source: DataSource, timestamp: Stamp, is_fresh: bool) -> TimestampedEntity<T> {
    TimestampedEntity {
        data: Some(data),
        source,
        timestamp,
        is_fresh,
    }
}

/// Local key for the cached copy of `cache_key`.
pub fn cache_store_key(cache_key: &str) -> String {
    format!("cache/{cache_key}")
}

struct LiveListener {
    path: String,
    handle: Unsubscribe,
    task: JoinHandle<()>,
}

impl LiveListener {
    fn teardown(self) {
        self.handle.unsubscribe();
        self.task.abort();
    }
}

pub struct FreshnessArbiter {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    connectivity: Arc<dyn ConnectivityOracle>,
    listeners: Mutex<HashMap<String, LiveListener>>,
}

impl FreshnessArbiter {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        connectivity: Arc<dyn ConnectivityOracle>,
    ) -> Self {
        Self {
            remote,
            local,
            connectivity,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_freshest_data<T>(&self, query: FreshnessQuery<T>) -> TimestampedEntity<T>
    where
        T: DeserializeOwned,
    {
        let cached = self.cached::<T>(&query.cache_key).await;
        let remote = query.remote_data.map(|data| {
            let stamp = query
                .remote_timestamp
                .as_deref()
                .map_or(Stamp::Never, Stamp::parse);
            (data, stamp)
        });
        let result = arbitrate(
            remote,
            cached.map(|record| (record.data, record.timestamp)),
            query.prefer_source,
        );
        tracing::trace!(
            key = %query.cache_key,
            source = %result.source,
            fresh = result.is_fresh,
            "freshness arbitrated"
        );
        result
    }

    /// The cached record for `cache_key`; unreadable entries read as absent.
    pub async fn cached<T: DeserializeOwned>(&self, cache_key: &str) -> Option<CachedRecord<T>> {
        read_record_or_absent(self.local.as_ref(), &cache_store_key(cache_key)).await
    }

    /// Store a locally produced copy. Write failures are surfaced.
    pub async fn cache_entity<T: Serialize>(
        &self,
        cache_key: &str,
        data: T,
        timestamp: Stamp,
    ) -> Result<(), SyncError> {
        let record = CachedRecord {
            data,
            timestamp,
            source: DataSource::Cache,
        };
        write_record(self.local.as_ref(), &cache_store_key(cache_key), &record).await
    }

    /// Open a live listener on `remote_path`. Each snapshot overwrites the
    /// cache entry for `cache_key`, stamped with the time it was observed, and
    /// is then passed to `projection`. Snapshots for one key are handled in
    /// arrival order. Any earlier listener on `cache_key` is torn down first.
    pub async fn subscribe_to_document<T, F>(
        &self,
        cache_key: &str,
        remote_path: &str,
        projection: F,
    ) -> DocumentSubscription
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(TimestampedEntity<T>) + Send + 'static,
    {
        if !self.connectivity.fetch().await.is_connected {
            tracing::debug!(key = %cache_key, "offline; document listener not opened");
            return DocumentSubscription::Offline;
        }
        self.unsubscribe(cache_key);

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let on_data = Box::new(move |doc: Value| {
            let _ = tx.send(doc);
        });
        let error_key = cache_key.to_string();
        let on_error = Box::new(move |err: RemoteError| {
            tracing::warn!(key = %error_key, error = %err, "document listener error");
        });

        let handle = match self.remote.subscribe(remote_path, on_data, on_error).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(key = %cache_key, path = %remote_path, error = %err, "document listener refused");
                return DocumentSubscription::Failed(err.to_string());
            }
        };

        let local = Arc::clone(&self.local);
        let store_key = cache_store_key(cache_key);
        let task = tokio::spawn(async move {
            while let Some(doc) = rx.recv().await {
                let data: T = match serde_json::from_value(doc) {
                    Ok(data) => data,
                    Err(err) => {
                        tracing::warn!(key = %store_key, error = %err, "undecodable snapshot skipped");
                        continue;
                    }
                };
                let record = CachedRecord {
                    data,
                    timestamp: Stamp::At(Utc::now()),
                    source: DataSource::Remote,
                };
                let written = match serde_json::to_string(&record) {
                    Ok(raw) => local.set(&store_key, raw).await.map_err(SyncError::from),
                    Err(err) => Err(SyncError::from(err)),
                };
                if let Err(err) = written {
                    tracing::warn!(key = %store_key, error = %err, "failed to cache snapshot");
                }
                projection(TimestampedEntity {
                    data: Some(record.data),
                    source: DataSource::Remote,
                    timestamp: record.timestamp,
                    is_fresh: true,
                });
            }
        });

        let listener = LiveListener {
            path: remote_path.to_string(),
            handle,
            task,
        };
        let displaced = self.listeners().insert(cache_key.to_string(), listener);
        if let Some(previous) = displaced {
            previous.teardown();
        }
        tracing::debug!(key = %cache_key, path = %remote_path, "document listener open");
        DocumentSubscription::Live
    }

    /// Close the listener on `cache_key`, if any.
    pub fn unsubscribe(&self, cache_key: &str) -> bool {
        let removed = self.listeners().remove(cache_key);
        match removed {
            Some(listener) => {
                tracing::debug!(key = %cache_key, path = %listener.path, "document listener closed");
                listener.teardown();
                true
            }
            None => false,
        }
    }

    /// Close every listener. Safe to call repeatedly.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<(String, LiveListener)> = self.listeners().drain().collect();
        let count = drained.len();
        for (_, listener) in drained {
            listener.teardown();
        }
        if count > 0 {
            tracing::info!(count, "document listeners closed");
        }
        count
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.listeners().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, LiveListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for FreshnessArbiter {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
