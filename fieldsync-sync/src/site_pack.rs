//! Site pack bootstrap: versioned bulk datasets that let a device run fully
//! offline from a cold start.
//!
//! Remote layout:
//!
//! ```text
//! site_packs/<siteId>/manifest   {version, generatedAt}
//! site_packs/<siteId>/pack       SitePack
//! ```
//!
//! The installed pack is one local record under [`PACK_KEY`]; replacing it is
//! a single store write, so readers see the old pack or the new one and a
//! failed install leaves the old one in place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use fieldsync_core::{
    InstallOutcome, SiteId, SitePack, SitePackManifest, SitePackStatus, UpdateCheck,
};

use crate::error::SyncError;
use crate::observable::{StatusBroadcaster, Unsubscribe};
use crate::store::{
    read_record, read_record_or_absent, write_record, ConnectivityOracle, LocalStore, RemoteStore,
};

pub const PACK_KEY: &str = "site_pack/current";
pub const STATUS_KEY: &str = "site_pack/status";

pub fn manifest_path(site: &SiteId) -> String {
    format!("site_packs/{site}/manifest")
}

pub fn pack_path(site: &SiteId) -> String {
    format!("site_packs/{site}/pack")
}

/// Lowercase hex SHA-256 of the JSON encoding of `datasets`.
pub fn datasets_checksum(
    datasets: &std::collections::BTreeMap<String, Value>,
) -> Result<String, SyncError> {
    let bytes = serde_json::to_vec(datasets)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    Ready,
    /// Marked initialized anyway; restoration continues in the background.
    TimedOut,
    AlreadyInitialized,
    /// Another `init` is running; this call did nothing.
    InFlight,
}

pub struct SitePackBootstrap {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    connectivity: Arc<dyn ConnectivityOracle>,
    status: StatusBroadcaster<SitePackStatus>,
    initialized: AtomicBool,
    init_in_flight: Arc<AtomicBool>,
    install_lock: Mutex<()>,
}

impl SitePackBootstrap {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        connectivity: Arc<dyn ConnectivityOracle>,
    ) -> Self {
        Self {
            remote,
            local,
            connectivity,
            status: StatusBroadcaster::new(SitePackStatus::default()),
            initialized: AtomicBool::new(false),
            init_in_flight: Arc::new(AtomicBool::new(false)),
            install_lock: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Init
    // -----------------------------------------------------------------------

    /// Restore persisted status and the installed pack header, waiting at
    /// most `timeout`. On timeout the bootstrap still counts as initialized
    /// and the restore is retried in the background.
    pub async fn init(self: &Arc<Self>, timeout: Duration) -> InitOutcome {
        if self.is_initialized() {
            return InitOutcome::AlreadyInitialized;
        }
        if self
            .init_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return InitOutcome::InFlight;
        }

        match tokio::time::timeout(timeout, self.restore()).await {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                self.init_in_flight.store(false, Ordering::SeqCst);
                InitOutcome::Ready
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "site pack init timed out; continuing with stale status"
                );
                self.initialized.store(true, Ordering::SeqCst);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.restore().await;
                    this.init_in_flight.store(false, Ordering::SeqCst);
                    tracing::info!("site pack status restored in background");
                });
                InitOutcome::TimedOut
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn restore(&self) {
        let persisted: SitePackStatus = read_record_or_absent(self.local.as_ref(), STATUS_KEY)
            .await
            .unwrap_or_default();
        let installed = self.installed_pack().await.map(|pack| pack.version);
        self.status
            .update(|live| *live = merge_restored(live, persisted, installed));
    }

    // -----------------------------------------------------------------------
    // Update check
    // -----------------------------------------------------------------------

    pub async fn check_for_update(&self, site: &SiteId) -> UpdateCheck {
        if !self.connectivity.fetch().await.is_connected {
            return UpdateCheck::NoUpdate;
        }
        let result = self.fetch_manifest(site).await;
        let installed = self.status.current().installed_version;
        let check = match &result {
            Ok(Some(manifest)) if installed.map_or(true, |v| manifest.version > v) => {
                UpdateCheck::Available {
                    version: manifest.version,
                }
            }
            Ok(_) => UpdateCheck::NoUpdate,
            Err(err) => {
                tracing::warn!(site = %site, error = %err, "site pack manifest check failed");
                UpdateCheck::NoUpdate
            }
        };
        let error = result.err().map(|err| err.to_string());
        self.set_status(|s| {
            s.last_check_time = Some(Utc::now());
            s.last_error = error;
        })
        .await;
        check
    }

    async fn fetch_manifest(&self, site: &SiteId) -> Result<Option<SitePackManifest>, SyncError> {
        match self.remote.get(&manifest_path(site)).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Install
    // -----------------------------------------------------------------------

    /// Download the site's pack and replace the installed one.
    pub async fn download_and_install_pack(&self, site: &SiteId) -> InstallOutcome {
        let _install = self.install_lock.lock().await;
        if !self.connectivity.fetch().await.is_connected {
            tracing::info!(site = %site, "offline; site pack install skipped");
            return InstallOutcome::failed("no connection");
        }

        self.set_status(|s| s.is_updating = true).await;
        let result = self.install(site).await;
        let outcome = match &result {
            Ok(version) => InstallOutcome::installed(*version),
            Err(err) => InstallOutcome::failed(err.to_string()),
        };
        self.set_status(|s| {
            s.is_updating = false;
            match &result {
                Ok(version) => {
                    s.installed_version = Some(*version);
                    s.last_update_time = Some(Utc::now());
                    s.last_error = None;
                }
                Err(err) => s.last_error = Some(err.to_string()),
            }
        })
        .await;

        match &result {
            Ok(version) => tracing::info!(site = %site, version, "site pack installed"),
            Err(err) => tracing::warn!(site = %site, error = %err, "site pack install failed"),
        }
        outcome
    }

    async fn install(&self, site: &SiteId) -> Result<u64, SyncError> {
        let doc = self
            .remote
            .get(&pack_path(site))
            .await?
            .ok_or_else(|| SyncError::PackRejected(format!("no pack published for '{site}'")))?;
        let pack: SitePack = serde_json::from_value(doc)?;

        if &pack.site_id != site {
            return Err(SyncError::PackRejected(format!(
                "pack is for site '{}', expected '{site}'",
                pack.site_id
            )));
        }
        if let Some(expected) = &pack.checksum {
            let actual = datasets_checksum(&pack.datasets)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SyncError::PackRejected(format!(
                    "checksum mismatch for version {}",
                    pack.version
                )));
            }
        }
        let installed: Option<SitePack> = read_record(self.local.as_ref(), PACK_KEY)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "installed site pack unreadable; replacing");
                None
            });
        if let Some(current) = installed.filter(|p| &p.site_id == site) {
            if pack.version < current.version {
                return Err(SyncError::PackRejected(format!(
                    "version {} is older than installed {}",
                    pack.version, current.version
                )));
            }
        }

        write_record(self.local.as_ref(), PACK_KEY, &pack).await?;
        Ok(pack.version)
    }

    /// Install when nothing is installed or a newer version is published.
    pub async fn load_pack(&self, site: &SiteId) -> InstallOutcome {
        let current = self
            .installed_pack()
            .await
            .filter(|pack| &pack.site_id == site);
        match current {
            None => self.download_and_install_pack(site).await,
            Some(pack) => match self.check_for_update(site).await {
                UpdateCheck::Available { .. } => self.download_and_install_pack(site).await,
                UpdateCheck::NoUpdate => InstallOutcome::installed(pack.version),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    pub async fn installed_pack(&self) -> Option<SitePack> {
        read_record_or_absent(self.local.as_ref(), PACK_KEY).await
    }

    pub async fn dataset(&self, name: &str) -> Option<Value> {
        self.installed_pack()
            .await
            .and_then(|mut pack| pack.datasets.remove(name))
    }

    pub fn status(&self) -> SitePackStatus {
        self.status.current()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&SitePackStatus) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.status.subscribe(listener)
    }

    async fn set_status(&self, apply: impl FnOnce(&mut SitePackStatus)) {
        let status = self.status.update(apply);
        if let Err(err) = write_record(self.local.as_ref(), STATUS_KEY, &status).await {
            tracing::warn!(error = %err, "failed to persist site pack status");
        }
    }
}

/// Fold a status read from disk into the live one. A check or install that
/// finished while the read was in progress is newer than the disk copy and
/// keeps its fields.
fn merge_restored(
    live: &SitePackStatus,
    persisted: SitePackStatus,
    installed: Option<u64>,
) -> SitePackStatus {
    let live_activity = live.last_check_time.max(live.last_update_time);
    let persisted_activity = persisted.last_check_time.max(persisted.last_update_time);
    let live_is_newer = live_activity.is_some() && live_activity >= persisted_activity;
    let installed_since = live.last_update_time > persisted.last_update_time;
    SitePackStatus {
        // Only a live install may hold the flag; a persisted one is a crash leftover.
        is_updating: live.is_updating,
        last_check_time: live.last_check_time.max(persisted.last_check_time),
        last_update_time: live.last_update_time.max(persisted.last_update_time),
        last_error: if live_is_newer {
            live.last_error.clone()
        } else {
            persisted.last_error
        },
        installed_version: if installed_since {
            live.installed_version
        } else {
            installed
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
