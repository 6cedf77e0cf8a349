//! fieldsync core library: domain types, device configuration, errors.
//!
//! - [`types`]: mutation envelopes, lock state, site packs
//! - [`config`]: `~/.fieldsync/config.yaml` load / save
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::DeviceConfig;
pub use error::ConfigError;
pub use types::{
    CompletedTodayLock, Connectivity, DataSource, DayHistorySnapshot, EntityId, EnvelopeId,
    InstallOutcome, LockType, MutationEnvelope, MutationRequest, OperationKind, Outcome,
    Percentage, PriorityClass, QcStatus, SiteId, SitePack, SitePackManifest, SitePackStatus,
    Stamp, SyncMode, SyncStatus, TimestampedEntity, TrackedEntity, UpdateCheck,
};
