//! Collaborator seams: remote document store, local durable store, and the
//! connectivity oracle.
//!
//! The subsystem never talks to a concrete backend directly. The daemon wires
//! in [`crate::file_store::FileStore`] and [`crate::http_remote`]; tests wire in
//! [`crate::memory`].

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use fieldsync_core::Connectivity;

use crate::error::{RemoteError, StoreError, SyncError};
use crate::observable::Unsubscribe;

/// Invoked with each document snapshot a subscription observes.
pub type DataCallback = Box<dyn Fn(Value) + Send + Sync>;
/// Invoked when a subscription hits an error; the subscription stays open.
pub type ErrorCallback = Box<dyn Fn(RemoteError) + Send + Sync>;

/// A managed document database reachable only while connected.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError>;

    /// Create or replace the document at `path`.
    async fn set(&self, path: &str, data: Value) -> Result<(), RemoteError>;

    /// Merge the top-level fields of `partial` into the document at `path`.
    async fn update(&self, path: &str, partial: Value) -> Result<(), RemoteError>;

    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    /// Stream snapshots of the document at `path` until unsubscribed.
    async fn subscribe(
        &self,
        path: &str,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe, RemoteError>;
}

/// Always-available key/value persistence for serialized records.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Reports connectivity on demand. Polled, never pushed.
#[async_trait]
pub trait ConnectivityOracle: Send + Sync {
    async fn fetch(&self) -> Connectivity;
}

// ---------------------------------------------------------------------------
// Typed record helpers
// ---------------------------------------------------------------------------

/// Read and decode `key`, surfacing both store and decode failures.
pub(crate) async fn read_record<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<T>, SyncError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Read and decode `key`; any failure is logged and reads as absent.
pub(crate) async fn read_record_or_absent<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Option<T> {
    match read_record(store, key).await {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "unreadable local record treated as absent");
            None
        }
    }
}

pub(crate) async fn write_record<T: Serialize + ?Sized>(
    store: &dyn LocalStore,
    key: &str,
    value: &T,
) -> Result<(), SyncError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw).await?;
    Ok(())
}
