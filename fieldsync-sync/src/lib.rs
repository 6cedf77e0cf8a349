//! Offline sync engines for a field device.
//!
//! - [`write_queue`]: priority write queue replayed against the remote
//! - [`freshness`]: cache-versus-remote arbitration and live document listeners
//! - [`day_lock`]: day-boundary lock over the "completed today" figure
//! - [`site_pack`]: versioned bulk dataset bootstrap
//!
//! Collaborators are injected as trait objects ([`store`]).

pub mod clock;
pub mod day_lock;
pub mod entity_store;
pub mod error;
pub mod file_store;
pub mod freshness;
pub mod http_remote;
pub mod memory;
pub mod observable;
pub mod site_pack;
pub mod store;
pub mod write_queue;

pub use clock::{Clock, FixedClock, SystemClock};
pub use day_lock::{DayBoundaryLock, LockRequest, RolloverOutcome, SweepReport, TimeLockOutcome};
pub use error::{RemoteError, StoreError, SyncError};
pub use file_store::FileStore;
pub use freshness::{CachedRecord, DocumentSubscription, FreshnessArbiter, FreshnessQuery};
pub use observable::{StatusBroadcaster, Unsubscribe};
pub use site_pack::{InitOutcome, SitePackBootstrap};
pub use store::{ConnectivityOracle, LocalStore, RemoteStore};
pub use write_queue::{SkipReason, SyncReport, WriteQueue};
