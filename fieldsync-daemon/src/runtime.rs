use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use fieldsync_core::{config, SyncMode};

use crate::error::{io_err, DaemonError};
use crate::paths::{data_dir, fieldsync_root, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::services::SyncServices;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = config::load_at(&home)?;
    let services = Arc::new(SyncServices::open(&home, config)?);
    services.start().await;

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let connectivity_handle = {
        let shutdown = shutdown_tx.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let result = connectivity_task(services, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let full_sync_handle = {
        let shutdown = shutdown_tx.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let result = full_sync_task(services, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let day_check_handle = {
        let shutdown = shutdown_tx.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let result = day_check_task(services, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(home, services, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (connectivity_result, full_sync_result, day_check_result, socket_result, signal_result) =
        tokio::join!(
            connectivity_handle,
            full_sync_handle,
            day_check_handle,
            socket_handle,
            signal_handle
        );

    services.teardown();

    handle_join("connectivity", connectivity_result)?;
    handle_join("full_sync", full_sync_result)?;
    handle_join("day_check", day_check_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Poll the oracle. A reconnect runs a critical pass and refreshes the site
/// pack when a newer one is published.
async fn connectivity_task(
    services: Arc<SyncServices>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut ticker = ticker(services.config().connectivity_poll(), true);
    let mut was_connected = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let connected = services.is_connected().await;
                on_connectivity(&services, was_connected, connected).await;
                was_connected = connected;
            }
        }
    }

    Ok(())
}

async fn on_connectivity(services: &SyncServices, was_connected: bool, connected: bool) {
    if let Some(report) = services.queue.observe_connectivity(connected).await {
        tracing::info!(
            succeeded = report.succeeded.len(),
            retrying = report.retrying.len(),
            demoted = report.demoted.len(),
            interrupted = report.interrupted,
            "reconnect critical sync finished",
        );
    }
    if !connected || was_connected {
        return;
    }
    let Some(site) = services.site(None) else {
        return;
    };
    let outcome = services.site_pack.load_pack(&site).await;
    if outcome.success {
        tracing::info!(site = %site, version = ?outcome.version, "site pack current");
    } else {
        tracing::warn!(
            site = %site,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "site pack refresh failed",
        );
    }
}

async fn full_sync_task(
    services: Arc<SyncServices>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut ticker = ticker(services.config().full_sync_interval(), false);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                if !services.is_connected().await {
                    tracing::debug!("offline; skipping scheduled full sync");
                    continue;
                }
                let report = services.queue.scheduled_full_sync().await;
                tracing::info!(
                    mode = %report.mode,
                    skipped = ?report.skipped,
                    succeeded = report.succeeded.len(),
                    retrying = report.retrying.len(),
                    demoted = report.demoted.len(),
                    pending = report.status.pending_count,
                    "scheduled sync finished",
                );
            }
        }
    }

    Ok(())
}

/// Roll over yesterday's locks and apply the time trigger past the cutoff.
async fn day_check_task(
    services: Arc<SyncServices>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut ticker = ticker(services.config().day_check_interval(), true);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let report = services.day_lock.sweep().await;
                if !report.rolled_over.is_empty() || !report.time_locked.is_empty() {
                    tracing::info!(
                        rolled_over = report.rolled_over.len(),
                        time_locked = report.time_locked.len(),
                        "day boundary sweep applied changes",
                    );
                }
                if !report.errors.is_empty() {
                    tracing::warn!(errors = report.errors.len(), "day boundary sweep had errors");
                }
            }
        }
    }

    Ok(())
}

fn ticker(period: Duration, immediate: bool) -> tokio::time::Interval {
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    home: PathBuf,
    services: Arc<SyncServices>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = fieldsync_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let services = services.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, services, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    services: Arc<SyncServices>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = handle_request(&services, &request, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

/// Answer one control request.
pub async fn handle_request(
    services: &SyncServices,
    request: &DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    tracing::debug!(cmd = %request.cmd, "daemon request");
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(services).await),
        "sync" => {
            let mode = request.mode.unwrap_or(SyncMode::Full);
            let report = services.queue.sync_queue(mode).await;
            DaemonResponse::ok(json!(report))
        }
        "retry" => match services.queue.retry_failed_items().await {
            Ok(report) => DaemonResponse::ok(json!(report)),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "clear" => match services.queue.clear_failed_items().await {
            Ok(cleared) => DaemonResponse::ok(json!({ "cleared": cleared })),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "pack-check" => {
            let Some(site) = services.site(request.site.as_deref()) else {
                return no_site();
            };
            let check = services.site_pack.check_for_update(&site).await;
            DaemonResponse::ok(json!({
                "site": site,
                "check": check,
                "status": services.site_pack.status(),
            }))
        }
        "pack-install" => {
            let Some(site) = services.site(request.site.as_deref()) else {
                return no_site();
            };
            let outcome = services.site_pack.download_and_install_pack(&site).await;
            DaemonResponse::ok(json!(outcome))
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn no_site() -> DaemonResponse {
    DaemonResponse::error("no site configured; run `fieldsync init --site <id>` or pass --site")
}

async fn build_status_payload(services: &SyncServices) -> Value {
    let failed: Vec<Value> = services
        .queue
        .failed_items()
        .await
        .into_iter()
        .map(|entry| {
            json!({
                "id": entry.id,
                "priority": entry.priority,
                "target_path": entry.target_path,
                "attempt_count": entry.attempt_count,
                "last_error": entry.last_error,
            })
        })
        .collect();

    let mut entities = Vec::new();
    for id in services.day_lock.tracked_ids().await {
        let Ok(entity) = services.day_lock.entity(&id).await else {
            continue;
        };
        let locked = services.day_lock.is_locked(&id).await.unwrap_or(false);
        entities.push(json!({
            "id": entity.id,
            "unit": entity.unit,
            "completed_today": entity.completed_today,
            "cumulative_completed": entity.cumulative_completed,
            "locked": locked,
        }));
    }

    json!({
        "running": true,
        "started_at": services.started_at(),
        "connected": services.is_connected().await,
        "site_id": services.config().site_id,
        "queue": services.queue.status(),
        "failed": failed,
        "site_pack": services.site_pack.status(),
        "entities": entities,
        "subscriptions": services.arbiter.active_subscriptions(),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [fieldsync_root(home), data_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{NaiveDate, TimeZone, Utc};
    use fieldsync_core::{
        DeviceConfig, MutationRequest, OperationKind, PriorityClass, SiteId, SitePack,
        TrackedEntity,
    };
    use fieldsync_sync::{
        memory::{MemoryLocalStore, MemoryRemoteStore, ToggleConnectivity},
        site_pack::{datasets_checksum, manifest_path, pack_path},
        FixedClock,
    };
    use tempfile::TempDir;

    struct Harness {
        services: Arc<SyncServices>,
        remote: Arc<MemoryRemoteStore>,
        net: ToggleConnectivity,
        shutdown: broadcast::Sender<()>,
    }

    fn harness(site: Option<&str>) -> Harness {
        let net = ToggleConnectivity::new(true);
        let remote = Arc::new(MemoryRemoteStore::new(net.clone()));
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).expect("date");
        let config = DeviceConfig {
            site_id: site.map(SiteId::from),
            ..DeviceConfig::default()
        };
        let services = SyncServices::from_parts(
            config,
            remote.clone(),
            Arc::new(MemoryLocalStore::new()),
            Arc::new(net.clone()),
            Arc::new(FixedClock::at(day, 9, 0).expect("clock")),
        )
        .expect("services");
        let (shutdown, _) = broadcast::channel(4);
        Harness {
            services: Arc::new(services),
            remote,
            net,
            shutdown,
        }
    }

    async fn ask(h: &Harness, request: DaemonRequest) -> DaemonResponse {
        handle_request(&h.services, &request, &h.shutdown).await
    }

    fn publish_pack(h: &Harness, site: &str, version: u64) {
        let site = SiteId::from(site);
        let mut datasets = BTreeMap::new();
        datasets.insert("materials".to_string(), json!(["C30"]));
        let pack = SitePack {
            version,
            site_id: site.clone(),
            generated_at: Utc.with_ymd_and_hms(2024, 1, 10, 6, 0, 0).unwrap(),
            checksum: Some(datasets_checksum(&datasets).expect("checksum")),
            datasets,
        };
        h.remote.insert_document(
            &manifest_path(&site),
            json!({"version": version, "generated_at": pack.generated_at}),
        );
        h.remote
            .insert_document(&pack_path(&site), serde_json::to_value(&pack).expect("pack"));
    }

    // -----------------------------------------------------------------------
    // Request dispatch
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sync_request_replays_critical_only_when_asked() {
        let h = harness(None);
        for (priority, path) in [(PriorityClass::P2, "routine"), (PriorityClass::P0, "safety")] {
            h.services
                .queue
                .enqueue(MutationRequest::new(
                    priority,
                    path,
                    OperationKind::Create,
                    json!({}),
                ))
                .await
                .expect("enqueue");
        }

        let response = ask(
            &h,
            DaemonRequest {
                mode: Some(SyncMode::Critical),
                ..DaemonRequest::new("sync")
            },
        )
        .await;

        assert!(response.ok, "{response:?}");
        assert_eq!(h.remote.accepted_paths(), vec!["safety"]);
        let data = response.data.expect("data");
        assert_eq!(data["mode"], json!("critical"));
        assert_eq!(data["status"]["p2_count"], json!(1));

        let response = ask(&h, DaemonRequest::new("sync")).await;
        assert_eq!(response.data.expect("data")["mode"], json!("full"));
        assert_eq!(h.remote.accepted_paths(), vec!["safety", "routine"]);
    }

    #[tokio::test]
    async fn status_reports_queue_pack_and_entities() {
        let h = harness(Some("north-yard"));
        h.net.set(false);
        h.services
            .day_lock
            .track(TrackedEntity::new("trench-4", "m"))
            .await
            .expect("track");
        h.services
            .queue
            .enqueue(MutationRequest::new(
                PriorityClass::P3,
                "photo",
                OperationKind::Create,
                json!({}),
            ))
            .await
            .expect("enqueue");

        let data = ask(&h, DaemonRequest::new("status"))
            .await
            .data
            .expect("status data");

        assert_eq!(data["running"], json!(true));
        assert_eq!(data["connected"], json!(false));
        assert_eq!(data["site_id"], json!("north-yard"));
        assert_eq!(data["queue"]["pending_count"], json!(1));
        assert_eq!(data["site_pack"]["is_updating"], json!(false));
        assert_eq!(data["entities"][0]["id"], json!("trench-4"));
        assert_eq!(data["entities"][0]["locked"], json!(false));
    }

    #[tokio::test]
    async fn retry_and_clear_act_on_failed_entries() {
        let h = harness(None);
        h.remote.fail_path("x", None);
        h.services
            .queue
            .enqueue(MutationRequest::new(
                PriorityClass::P1,
                "x",
                OperationKind::Create,
                json!({}),
            ))
            .await
            .expect("enqueue");
        for _ in 0..h.services.config().retry_ceiling {
            ask(&h, DaemonRequest::new("sync")).await;
        }
        assert_eq!(h.services.queue.status().failed_count, 1);

        let retried = ask(&h, DaemonRequest::new("retry")).await;
        assert!(retried.ok);
        assert_eq!(retried.data.expect("data")["retrying"].as_array().map(Vec::len), Some(1));

        let cleared = ask(&h, DaemonRequest::new("clear")).await;
        assert_eq!(cleared.data.expect("data")["cleared"], json!(0), "entry went back to pending");
        assert_eq!(h.services.queue.status().pending_count, 1);
    }

    #[tokio::test]
    async fn pack_commands_use_configured_or_requested_site() {
        let h = harness(None);
        let response = ask(&h, DaemonRequest::new("pack-install")).await;
        assert!(!response.ok);
        assert!(response.error.unwrap_or_default().contains("no site"));

        publish_pack(&h, "north-yard", 2);
        let check = ask(
            &h,
            DaemonRequest {
                site: Some("north-yard".to_string()),
                ..DaemonRequest::new("pack-check")
            },
        )
        .await
        .data
        .expect("check data");
        assert_eq!(check["check"], json!({"kind": "available", "version": 2}));

        let install = ask(
            &h,
            DaemonRequest {
                site: Some("north-yard".to_string()),
                ..DaemonRequest::new("pack-install")
            },
        )
        .await
        .data
        .expect("install data");
        assert_eq!(install["success"], json!(true));
        assert_eq!(h.services.site_pack.status().installed_version, Some(2));
    }

    #[tokio::test]
    async fn stop_broadcasts_shutdown_and_unknown_is_rejected() {
        let h = harness(None);
        let mut shutdown_rx = h.shutdown.subscribe();

        let unknown = ask(&h, DaemonRequest::new("reboot")).await;
        assert_eq!(unknown.error.as_deref(), Some("unknown command 'reboot'"));

        let stop = ask(&h, DaemonRequest::new("stop")).await;
        assert_eq!(stop.data, Some(json!({"stopping": true})));
        shutdown_rx.recv().await.expect("shutdown signal");
    }

    // -----------------------------------------------------------------------
    // Connectivity edge
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn reconnect_runs_critical_pass_and_loads_pack() {
        let h = harness(Some("north-yard"));
        publish_pack(&h, "north-yard", 4);
        h.services
            .queue
            .enqueue(MutationRequest::new(
                PriorityClass::P0,
                "safety",
                OperationKind::Create,
                json!({}),
            ))
            .await
            .expect("enqueue");

        on_connectivity(&h.services, false, true).await;

        assert_eq!(h.remote.accepted_paths(), vec!["safety"]);
        assert_eq!(h.services.site_pack.status().installed_version, Some(4));

        // Already connected: nothing new happens.
        publish_pack(&h, "north-yard", 5);
        on_connectivity(&h.services, true, true).await;
        assert_eq!(h.services.site_pack.status().installed_version, Some(4));
    }

    // -----------------------------------------------------------------------
    // Socket round trip
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn socket_serves_status_then_stops() {
        let home = TempDir::new().expect("home");
        let h = harness(None);
        let server = tokio::spawn(socket_server_task(
            home.path().to_path_buf(),
            h.services.clone(),
            h.shutdown.clone(),
            h.shutdown.subscribe(),
        ));

        let socket = socket_path(home.path());
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let client_home = home.path().to_path_buf();
        let (status, stop) = tokio::task::spawn_blocking(move || {
            let status = crate::protocol::request_status(&client_home);
            let stop = crate::protocol::request_stop(&client_home);
            (status, stop)
        })
        .await
        .expect("client join");

        assert_eq!(status.expect("status")["running"], json!(true));
        stop.expect("stop");
        server
            .await
            .expect("server join")
            .expect("server exits cleanly");
        assert!(!socket.exists(), "socket removed on shutdown");
    }

    #[test]
    fn stale_socket_file_is_removed_before_bind() {
        let home = TempDir::new().expect("home");
        let socket = socket_path(home.path());
        fs::create_dir_all(socket.parent().expect("parent")).expect("mkdir");
        fs::write(&socket, b"").expect("stale file");

        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }
}
