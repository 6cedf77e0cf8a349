//! Error types for fieldsync-sync.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use fieldsync_core::EntityId;

/// Failures of the local durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Keys are `/`-separated segments of `[A-Za-z0-9._-]`, no `..`.
    #[error("invalid store key '{0}'")]
    InvalidKey(String),

    /// The backing store refused the operation.
    #[error("local store unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("no connection")]
    Offline,

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("remote rejected {path}: {reason}")]
    Rejected { path: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// JSON serialization/deserialization error for a stored record.
    #[error("record JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entity '{0}' is not tracked")]
    EntityNotFound(EntityId),

    /// `lock` called on an entity whose day is already frozen.
    #[error("entity '{entity}' is already locked for {date}")]
    AlreadyLocked { entity: EntityId, date: NaiveDate },

    /// Progress edits are rejected once the day is frozen.
    #[error("entity '{0}' is locked for today; its figure can no longer change")]
    Frozen(EntityId),

    #[error("site pack rejected: {0}")]
    PackRejected(String),
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
