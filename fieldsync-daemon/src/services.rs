//! Composition root: one instance of each sync engine, sharing a local store,
//! a remote store and a connectivity oracle, with an explicit start/teardown
//! lifecycle.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use fieldsync_core::{DeviceConfig, SiteId};
use fieldsync_sync::{
    http_remote::{HttpConnectivity, HttpRemoteStore},
    memory::{MemoryRemoteStore, ToggleConnectivity},
    Clock, ConnectivityOracle, DayBoundaryLock, FileStore, FreshnessArbiter, InitOutcome,
    LocalStore, RemoteStore, SitePackBootstrap, SystemClock, WriteQueue,
};

use crate::error::DaemonError;
use crate::paths::data_dir;

/// What [`SyncServices::start`] restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub queued: usize,
    pub site_pack: InitOutcome,
}

pub struct SyncServices {
    config: DeviceConfig,
    connectivity: Arc<dyn ConnectivityOracle>,
    started_at: DateTime<Utc>,
    pub queue: Arc<WriteQueue>,
    pub arbiter: FreshnessArbiter,
    pub day_lock: DayBoundaryLock,
    pub site_pack: Arc<SitePackBootstrap>,
}

impl SyncServices {
    /// Services backed by `<home>/.fieldsync/data`. Without a `remote_url`
    /// the remote is an in-process store that is always reachable.
    pub fn open(home: &Path, config: DeviceConfig) -> Result<Self, DaemonError> {
        let local: Arc<dyn LocalStore> = Arc::new(FileStore::new(data_dir(home)));
        let (remote, connectivity) = match config.remote_url.as_deref() {
            Some(url) => {
                tracing::info!(remote = %url, "using HTTP remote store");
                let remote: Arc<dyn RemoteStore> =
                    Arc::new(HttpRemoteStore::new(url, config.http_timeout()));
                let connectivity: Arc<dyn ConnectivityOracle> =
                    Arc::new(HttpConnectivity::new(url, config.http_timeout()));
                (remote, connectivity)
            }
            None => {
                tracing::info!("no remote_url configured; using in-process remote store");
                let net = ToggleConnectivity::new(true);
                let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemoteStore::new(net.clone()));
                let connectivity: Arc<dyn ConnectivityOracle> = Arc::new(net);
                (remote, connectivity)
            }
        };
        Self::from_parts(config, remote, local, connectivity, Arc::new(SystemClock))
    }

    pub fn from_parts(
        config: DeviceConfig,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        connectivity: Arc<dyn ConnectivityOracle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let queue = Arc::new(WriteQueue::new(
            remote.clone(),
            local.clone(),
            connectivity.clone(),
            config.retry_ceiling,
        ));
        let day_lock = DayBoundaryLock::new(local.clone(), clock, config.cutoff()?)
            .with_outbox(queue.clone());
        let arbiter = FreshnessArbiter::new(remote.clone(), local.clone(), connectivity.clone());
        let site_pack = Arc::new(SitePackBootstrap::new(remote, local, connectivity.clone()));

        Ok(Self {
            config,
            connectivity,
            started_at: Utc::now(),
            queue,
            arbiter,
            day_lock,
            site_pack,
        })
    }

    /// Restore the persisted queue and the site pack status.
    pub async fn start(&self) -> StartReport {
        let queued = self.queue.load().await;
        let site_pack = self.site_pack.init(self.config.init_timeout()).await;
        tracing::info!(queued, site_pack = ?site_pack, "sync services started");
        StartReport { queued, site_pack }
    }

    /// Drop every live document listener. Safe to call more than once.
    pub fn teardown(&self) -> usize {
        let closed = self.arbiter.unsubscribe_all();
        if closed > 0 {
            tracing::info!(closed, "document listeners closed");
        }
        closed
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn is_connected(&self) -> bool {
        self.connectivity.fetch().await.is_connected
    }

    /// `requested` if given, otherwise the configured site.
    pub fn site(&self, requested: Option<&str>) -> Option<SiteId> {
        requested
            .map(SiteId::from)
            .or_else(|| self.config.site_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_sync::{memory::MemoryLocalStore, FixedClock};
    use tempfile::TempDir;

    fn clock() -> Arc<FixedClock> {
        let day = chrono::NaiveDate::from_ymd_opt(2024, 1, 10).expect("date");
        Arc::new(FixedClock::at(day, 9, 0).expect("clock"))
    }

    #[tokio::test]
    async fn start_restores_queue_and_marks_pack_initialized() {
        let net = ToggleConnectivity::new(false);
        let services = SyncServices::from_parts(
            DeviceConfig::default(),
            Arc::new(MemoryRemoteStore::new(net.clone())),
            Arc::new(MemoryLocalStore::new()),
            Arc::new(net),
            clock(),
        )
        .expect("services");

        let report = services.start().await;

        assert_eq!(report.queued, 0);
        assert_eq!(report.site_pack, InitOutcome::Ready);
        assert!(services.site_pack.is_initialized());
        assert_eq!(services.teardown(), 0);
    }

    #[test]
    fn invalid_cutoff_is_rejected_at_wiring() {
        let home = TempDir::new().expect("home");
        let config = DeviceConfig {
            time_lock_cutoff: "midnight".to_string(),
            ..DeviceConfig::default()
        };
        assert!(matches!(
            SyncServices::open(home.path(), config),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn requested_site_overrides_configured_one() {
        let home = TempDir::new().expect("home");
        let config = DeviceConfig {
            site_id: Some(SiteId::from("north-yard")),
            ..DeviceConfig::default()
        };
        let services = SyncServices::open(home.path(), config).expect("services");
        assert_eq!(services.site(None), Some(SiteId::from("north-yard")));
        assert_eq!(services.site(Some("south-yard")), Some(SiteId::from("south-yard")));
    }
}
