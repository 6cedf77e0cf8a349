//! In-process collaborators.
//!
//! Used by the daemon when no remote endpoint is configured, and by tests,
//! which rely on the failure-injection knobs and the dispatch log.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use fieldsync_core::{Connectivity, OperationKind};

use crate::error::{RemoteError, StoreError};
use crate::observable::Unsubscribe;
use crate::store::{ConnectivityOracle, DataCallback, ErrorCallback, LocalStore, RemoteStore};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

/// A connectivity flag that can be flipped at runtime. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct ToggleConnectivity {
    connected: Arc<AtomicBool>,
}

impl ToggleConnectivity {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(connected)),
        }
    }

    pub fn set(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityOracle for ToggleConnectivity {
    async fn fetch(&self) -> Connectivity {
        Connectivity {
            is_connected: self.is_connected(),
        }
    }
}

// ---------------------------------------------------------------------------
// Local store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: Mutex<BTreeMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: Mutex<Option<String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get` fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `set`/`remove` fail for keys starting with `prefix` (`""` fails
    /// every write). `None` clears the injection.
    pub fn fail_writes_matching(&self, prefix: Option<&str>) {
        *guard(&self.fail_writes) = prefix.map(str::to_string);
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        guard(&self.entries).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        guard(&self.entries).keys().cloned().collect()
    }

    fn check_write(&self, key: &str) -> Result<(), StoreError> {
        match guard(&self.fail_writes).as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(StoreError::Unavailable(format!(
                "injected write failure for '{key}'"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "injected read failure for '{key}'"
            )));
        }
        Ok(guard(&self.entries).get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.check_write(key)?;
        guard(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check_write(key)?;
        guard(&self.entries).remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote store
// ---------------------------------------------------------------------------

/// One write as seen by the remote, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub path: String,
    pub operation: OperationKind,
    pub payload: Value,
    pub accepted: bool,
}

type Subscriber = (u64, Arc<DataCallback>, Arc<ErrorCallback>);

/// A document map that honours a shared [`ToggleConnectivity`]: every call
/// fails with [`RemoteError::Offline`] while it reads disconnected.
pub struct MemoryRemoteStore {
    connectivity: ToggleConnectivity,
    docs: Mutex<BTreeMap<String, Value>>,
    log: Mutex<Vec<Dispatch>>,
    failures: Mutex<HashMap<String, Option<u32>>>,
    latency: Mutex<Option<Duration>>,
    subscribers: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    next_subscriber: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new(connectivity: ToggleConnectivity) -> Self {
        Self {
            connectivity,
            docs: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
        }
    }

    pub fn connectivity(&self) -> &ToggleConnectivity {
        &self.connectivity
    }

    /// Reject the next `times` writes to `path`, or every write when `None`.
    pub fn fail_path(&self, path: &str, times: Option<u32>) {
        guard(&self.failures).insert(path.to_string(), times);
    }

    pub fn clear_failures(&self) {
        guard(&self.failures).clear();
    }

    /// Delay every write by `latency` (a tokio sleep, so paused clocks apply).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *guard(&self.latency) = latency;
    }

    /// Every write attempt, accepted or not, in arrival order.
    pub fn dispatch_log(&self) -> Vec<Dispatch> {
        guard(&self.log).clone()
    }

    /// Paths of accepted writes in arrival order.
    pub fn accepted_paths(&self) -> Vec<String> {
        guard(&self.log)
            .iter()
            .filter(|d| d.accepted)
            .map(|d| d.path.clone())
            .collect()
    }

    pub fn document(&self, path: &str) -> Option<Value> {
        guard(&self.docs).get(path).cloned()
    }

    /// Seed a document without notifying subscribers or logging a dispatch.
    pub fn insert_document(&self, path: &str, doc: Value) {
        guard(&self.docs).insert(path.to_string(), doc);
    }

    /// Simulate a change made by another device: store and notify.
    pub fn emit(&self, path: &str, doc: Value) {
        guard(&self.docs).insert(path.to_string(), doc.clone());
        self.notify(path, doc);
    }

    /// Deliver an error to every subscriber of `path`.
    pub fn emit_error(&self, path: &str, err: RemoteError) {
        let targets: Vec<Arc<ErrorCallback>> = guard(&self.subscribers)
            .get(path)
            .map(|subs| subs.iter().map(|(_, _, e)| Arc::clone(e)).collect())
            .unwrap_or_default();
        for on_error in targets {
            on_error(err.clone());
        }
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        guard(&self.subscribers).get(path).map_or(0, Vec::len)
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.connectivity.is_connected() {
            Ok(())
        } else {
            Err(RemoteError::Offline)
        }
    }

    fn take_failure(&self, path: &str) -> bool {
        let mut failures = guard(&self.failures);
        match failures.get_mut(path) {
            Some(None) => true,
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn write(
        &self,
        path: &str,
        operation: OperationKind,
        payload: Value,
    ) -> Result<(), RemoteError> {
        let latency = *guard(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.ensure_online()?;

        let rejected = self.take_failure(path);
        guard(&self.log).push(Dispatch {
            path: path.to_string(),
            operation,
            payload: payload.clone(),
            accepted: !rejected,
        });
        if rejected {
            return Err(RemoteError::Rejected {
                path: path.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let snapshot = {
            let mut docs = guard(&self.docs);
            match operation {
                OperationKind::Create => {
                    docs.insert(path.to_string(), payload);
                }
                OperationKind::Update => {
                    let doc = docs
                        .entry(path.to_string())
                        .or_insert_with(|| Value::Object(Default::default()));
                    merge_fields(doc, payload);
                }
                OperationKind::Delete => {
                    docs.remove(path);
                }
            }
            docs.get(path).cloned()
        };
        if let Some(doc) = snapshot {
            self.notify(path, doc);
        }
        Ok(())
    }

    fn notify(&self, path: &str, doc: Value) {
        let targets: Vec<Arc<DataCallback>> = guard(&self.subscribers)
            .get(path)
            .map(|subs| subs.iter().map(|(_, d, _)| Arc::clone(d)).collect())
            .unwrap_or_default();
        for on_data in targets {
            on_data(doc.clone());
        }
    }
}

fn merge_fields(doc: &mut Value, partial: Value) {
    match (doc, partial) {
        (Value::Object(target), Value::Object(fields)) => {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        (doc, partial) => *doc = partial,
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        self.ensure_online()?;
        Ok(self.document(path))
    }

    async fn set(&self, path: &str, data: Value) -> Result<(), RemoteError> {
        self.write(path, OperationKind::Create, data).await
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), RemoteError> {
        self.write(path, OperationKind::Update, partial).await
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.write(path, OperationKind::Delete, Value::Null).await
    }

    async fn subscribe(
        &self,
        path: &str,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe, RemoteError> {
        self.ensure_online()?;
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let on_data = Arc::new(on_data);
        guard(&self.subscribers)
            .entry(path.to_string())
            .or_default()
            .push((id, Arc::clone(&on_data), Arc::new(on_error)));

        // Initial snapshot, as a live listener would deliver on attach.
        if let Some(doc) = self.document(path) {
            on_data(doc);
        }

        let subscribers = Arc::clone(&self.subscribers);
        let path = path.to_string();
        Ok(Unsubscribe::new(move || {
            let mut subscribers = guard(&subscribers);
            if let Some(subs) = subscribers.get_mut(&path) {
                subs.retain(|(sub_id, _, _)| *sub_id != id);
                if subs.is_empty() {
                    subscribers.remove(&path);
                }
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn offline_remote_rejects_everything() {
        let remote = MemoryRemoteStore::new(ToggleConnectivity::new(false));
        assert_eq!(remote.get("a").await, Err(RemoteError::Offline));
        assert_eq!(remote.set("a", json!(1)).await, Err(RemoteError::Offline));
        assert!(remote.dispatch_log().is_empty());
    }

    #[tokio::test]
    async fn update_merges_top_level_fields() {
        let remote = MemoryRemoteStore::new(ToggleConnectivity::new(true));
        remote.set("doc", json!({"a": 1, "b": 2})).await.unwrap();
        remote.update("doc", json!({"b": 3, "c": 4})).await.unwrap();
        assert_eq!(remote.document("doc"), Some(json!({"a": 1, "b": 3, "c": 4})));
    }

    #[tokio::test]
    async fn injected_failures_are_counted_down() {
        let remote = MemoryRemoteStore::new(ToggleConnectivity::new(true));
        remote.fail_path("doc", Some(1));
        assert!(remote.set("doc", json!(1)).await.is_err());
        assert!(remote.set("doc", json!(2)).await.is_ok());
        assert_eq!(remote.dispatch_log().len(), 2);
        assert_eq!(remote.accepted_paths(), vec!["doc".to_string()]);
    }

    #[tokio::test]
    async fn local_write_injection_matches_prefix() {
        let local = MemoryLocalStore::new();
        local.fail_writes_matching(Some("history/"));
        assert!(local.set("history/x/2024-01-10", "1".into()).await.is_err());
        assert!(local.set("entities/x", "1".into()).await.is_ok());
        local.fail_writes_matching(None);
        assert!(local.set("history/x/2024-01-10", "1".into()).await.is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber() {
        let remote = MemoryRemoteStore::new(ToggleConnectivity::new(true));
        let handle = remote
            .subscribe("doc", Box::new(|_| {}), Box::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(remote.subscriber_count("doc"), 1);
        handle.unsubscribe();
        assert_eq!(remote.subscriber_count("doc"), 0);
    }
}
