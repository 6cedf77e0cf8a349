//! Priority write queue.
//!
//! Captures locally-originated mutations, persists them as one list under
//! [`QUEUE_KEY`], and replays them against the remote in class order.
//!
//! ## Replay rules
//!
//! - `critical` covers `P0` only; `full` covers `P0..P3`, always class order
//!   first and enqueue order within a class.
//! - One remote attempt per entry per pass. Success removes the entry; failure
//!   bumps `attempt_count` and, at the retry ceiling, demotes it to failed.
//!   Failed entries only come back through [`WriteQueue::retry_failed_items`].
//! - Losing the connection mid-pass ends the pass without charging an attempt
//!   to the entry that hit it.
//! - Passes are coalesced: a call made while one is in flight returns at once.
//!
//! The entry list is guarded by an async mutex that is never held across a
//! remote call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use fieldsync_core::{
    EnvelopeId, MutationEnvelope, MutationRequest, OperationKind, Outcome, SyncMode, SyncStatus,
};

use crate::error::{RemoteError, SyncError};
use crate::observable::{StatusBroadcaster, Unsubscribe};
use crate::store::{read_record, write_record, ConnectivityOracle, LocalStore, RemoteStore};

/// Local key holding the persisted entry list.
pub const QUEUE_KEY: &str = "write_queue";

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
}

/// What one call to [`WriteQueue::sync_queue`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    /// Entries handed to the remote, in dispatch order.
    pub dispatched: Vec<EnvelopeId>,
    pub succeeded: Vec<EnvelopeId>,
    /// Failed this pass but still under the retry ceiling.
    pub retrying: Vec<EnvelopeId>,
    /// Reached the retry ceiling this pass.
    pub demoted: Vec<EnvelopeId>,
    /// Connectivity dropped before the pass reached every entry.
    pub interrupted: bool,
    /// Persisting the list after a dispatch failed; the pass stopped there and
    /// the durable copy lags the in-memory one until the next write lands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
    pub status: SyncStatus,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            skipped: None,
            dispatched: Vec::new(),
            succeeded: Vec::new(),
            retrying: Vec::new(),
            demoted: Vec::new(),
            interrupted: false,
            persist_error: None,
            status: SyncStatus::default(),
        }
    }

    fn skipped(mode: SyncMode, reason: SkipReason, status: SyncStatus) -> Self {
        Self {
            skipped: Some(reason),
            status,
            ..Self::new(mode)
        }
    }

    /// A pass that ran to the end of its batch with every outcome durable.
    pub fn completed(&self) -> bool {
        self.skipped.is_none() && !self.interrupted && self.persist_error.is_none()
    }
}

pub struct WriteQueue {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    connectivity: Arc<dyn ConnectivityOracle>,
    retry_ceiling: u32,
    entries: Mutex<Vec<MutationEnvelope>>,
    next_seq: AtomicU64,
    in_flight: AtomicBool,
    was_connected: AtomicBool,
    critical_pass_done: AtomicBool,
    status: StatusBroadcaster<SyncStatus>,
}

impl WriteQueue {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        connectivity: Arc<dyn ConnectivityOracle>,
        retry_ceiling: u32,
    ) -> Self {
        Self {
            remote,
            local,
            connectivity,
            retry_ceiling: retry_ceiling.max(1),
            entries: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
            critical_pass_done: AtomicBool::new(false),
            status: StatusBroadcaster::new(SyncStatus::default()),
        }
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Restore the persisted list. An unreadable list degrades to an empty
    /// queue. Returns the number of entries restored.
    pub async fn load(&self) -> usize {
        let restored: Vec<MutationEnvelope> =
            match read_record(self.local.as_ref(), QUEUE_KEY).await {
                Ok(Some(list)) => list,
                Ok(None) => Vec::new(),
                Err(err) => {
                    tracing::error!(error = %err, "persisted write queue unreadable; starting empty");
                    Vec::new()
                }
            };

        let mut entries = self.entries.lock().await;
        *entries = restored;
        entries.sort_by_key(|e| e.seq);
        let next = entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        self.next_seq.fetch_max(next, Ordering::SeqCst);
        self.recount(&entries);
        tracing::info!(entries = entries.len(), "write queue restored");
        entries.len()
    }

    async fn persist(&self, entries: &[MutationEnvelope]) -> Result<(), SyncError> {
        write_record(self.local.as_ref(), QUEUE_KEY, entries).await
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Append `request` and persist the list. No network call is made; the
    /// broadcast status includes the new entry before this returns.
    pub async fn enqueue(&self, request: MutationRequest) -> Result<MutationEnvelope, SyncError> {
        let mut entries = self.entries.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let envelope = MutationEnvelope {
            id: EnvelopeId(format!("{}-{seq:06}", now.format("%Y%m%dT%H%M%S%3f"))),
            seq,
            priority: request.priority,
            target_path: request.target_path,
            operation: request.operation,
            payload: request.payload,
            enqueued_at: now,
            attempt_count: 0,
            last_error: None,
            outcome: Outcome::Pending,
        };
        entries.push(envelope.clone());

        if let Err(err) = self.persist(&entries).await {
            entries.pop();
            tracing::error!(
                id = %envelope.id,
                path = %envelope.target_path,
                error = %err,
                "enqueue not durable; mutation dropped"
            );
            return Err(err);
        }

        self.recount(&entries);
        tracing::debug!(
            id = %envelope.id,
            priority = %envelope.priority,
            operation = %envelope.operation,
            path = %envelope.target_path,
            "mutation queued"
        );
        Ok(envelope)
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    pub async fn sync_queue(&self, mode: SyncMode) -> SyncReport {
        let Some(guard) = InFlight::acquire(&self.in_flight, &self.status) else {
            tracing::debug!(%mode, "sync already in flight; coalesced");
            return SyncReport::skipped(mode, SkipReason::AlreadySyncing, self.status());
        };

        if !self.connectivity.fetch().await.is_connected {
            tracing::debug!(%mode, "offline; sync pass skipped");
            drop(guard);
            return SyncReport::skipped(mode, SkipReason::Offline, self.status());
        }

        self.status.update(|s| s.is_syncing = true);
        let mut report = self.replay(mode).await;

        if report.completed() {
            let now = Utc::now();
            self.critical_pass_done.store(true, Ordering::SeqCst);
            self.status.update(|s| {
                s.last_critical_sync_at = Some(now);
                if mode == SyncMode::Full {
                    s.last_full_sync_at = Some(now);
                }
            });
        }
        drop(guard);

        report.status = self.status();
        tracing::info!(
            %mode,
            dispatched = report.dispatched.len(),
            succeeded = report.succeeded.len(),
            retrying = report.retrying.len(),
            demoted = report.demoted.len(),
            interrupted = report.interrupted,
            persist_failed = report.persist_error.is_some(),
            "sync pass finished"
        );
        report
    }

    async fn replay(&self, mode: SyncMode) -> SyncReport {
        let mut report = SyncReport::new(mode);
        let batch: Vec<MutationEnvelope> = {
            let entries = self.entries.lock().await;
            let mut batch: Vec<MutationEnvelope> = entries
                .iter()
                .filter(|e| e.is_pending() && mode.covers(e.priority))
                .cloned()
                .collect();
            batch.sort_by_key(|e| (e.priority, e.seq));
            batch
        };

        for envelope in batch {
            report.dispatched.push(envelope.id.clone());
            let result = dispatch(self.remote.as_ref(), &envelope).await;

            let mut entries = self.entries.lock().await;
            let Some(pos) = entries.iter().position(|e| e.id == envelope.id) else {
                // Cleared while the write was in flight.
                continue;
            };

            match result {
                Ok(()) => {
                    entries.remove(pos);
                    report.succeeded.push(envelope.id.clone());
                }
                Err(RemoteError::Offline) => {
                    tracing::warn!(id = %envelope.id, "connection lost mid-pass");
                    report.interrupted = true;
                    break;
                }
                Err(err) => {
                    let entry = &mut entries[pos];
                    entry.attempt_count += 1;
                    entry.last_error = Some(err.to_string());
                    if entry.attempt_count >= self.retry_ceiling {
                        entry.outcome = Outcome::Failed;
                        report.demoted.push(entry.id.clone());
                        tracing::error!(
                            id = %entry.id,
                            path = %entry.target_path,
                            attempts = entry.attempt_count,
                            error = %err,
                            "retry ceiling reached; mutation marked failed"
                        );
                    } else {
                        report.retrying.push(entry.id.clone());
                        tracing::warn!(
                            id = %entry.id,
                            path = %entry.target_path,
                            attempts = entry.attempt_count,
                            error = %err,
                            "remote write failed; will retry"
                        );
                    }
                }
            }

            self.recount(&entries);
            if let Err(err) = self.persist(&entries).await {
                tracing::error!(
                    id = %envelope.id,
                    error = %err,
                    "failed to persist write queue after dispatch; pass stopped"
                );
                report.persist_error = Some(err.to_string());
                break;
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Feed the latest connectivity reading. A disconnected→connected edge
    /// runs a critical pass and returns its report.
    pub async fn observe_connectivity(&self, connected: bool) -> Option<SyncReport> {
        let was = self.was_connected.swap(connected, Ordering::SeqCst);
        if !connected {
            if was {
                self.critical_pass_done.store(false, Ordering::SeqCst);
                tracing::info!("connectivity lost");
            }
            return None;
        }
        if was {
            return None;
        }
        tracing::info!("connectivity restored; running critical sync");
        Some(self.sync_queue(SyncMode::Critical).await)
    }

    /// True once a critical or full pass has completed since the last
    /// reconnect.
    pub fn has_completed_critical_pass(&self) -> bool {
        self.critical_pass_done.load(Ordering::SeqCst)
    }

    /// Timer entry point. Until a critical pass has completed, runs that
    /// first, so bulk classes never go out ahead of `P0`.
    pub async fn scheduled_full_sync(&self) -> SyncReport {
        if !self.has_completed_critical_pass() {
            let critical = self.sync_queue(SyncMode::Critical).await;
            if !critical.completed() {
                return critical;
            }
        }
        self.sync_queue(SyncMode::Full).await
    }

    // -----------------------------------------------------------------------
    // Failed entries
    // -----------------------------------------------------------------------

    /// Reset failed entries to pending and replay everything in class order.
    pub async fn retry_failed_items(&self) -> Result<SyncReport, SyncError> {
        {
            let mut entries = self.entries.lock().await;
            let before = entries.clone();
            let mut reset = 0usize;
            for entry in entries.iter_mut().filter(|e| e.is_failed()) {
                entry.outcome = Outcome::Pending;
                entry.attempt_count = 0;
                entry.last_error = None;
                reset += 1;
            }
            if reset > 0 {
                if let Err(err) = self.persist(&entries).await {
                    *entries = before;
                    return Err(err);
                }
                self.recount(&entries);
            }
            tracing::info!(reset, "failed mutations reset for retry");
        }
        Ok(self.sync_queue(SyncMode::Full).await)
    }

    /// Discard failed entries without replay. Returns how many were dropped.
    pub async fn clear_failed_items(&self) -> Result<usize, SyncError> {
        let mut entries = self.entries.lock().await;
        let before = entries.clone();
        entries.retain(|e| !e.is_failed());
        let cleared = before.len() - entries.len();
        if cleared == 0 {
            return Ok(0);
        }
        if let Err(err) = self.persist(&entries).await {
            *entries = before;
            return Err(err);
        }
        self.recount(&entries);
        tracing::warn!(cleared, "failed mutations discarded");
        Ok(cleared)
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Deliver the current status now and on every change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.status.subscribe(listener)
    }

    pub async fn entries(&self) -> Vec<MutationEnvelope> {
        self.entries.lock().await.clone()
    }

    pub async fn failed_items(&self) -> Vec<MutationEnvelope> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.is_failed())
            .cloned()
            .collect()
    }

    fn recount(&self, entries: &[MutationEnvelope]) {
        self.status.update(|s| s.recount(entries));
    }
}

async fn dispatch(remote: &dyn RemoteStore, envelope: &MutationEnvelope) -> Result<(), RemoteError> {
    let path = envelope.target_path.as_str();
    match envelope.operation {
        OperationKind::Create => remote.set(path, envelope.payload.clone()).await,
        OperationKind::Update => remote.update(path, envelope.payload.clone()).await,
        OperationKind::Delete => remote.delete(path).await,
    }
}

/// Holds the in-flight flag for one pass; releasing it also clears
/// `is_syncing`, so a cancelled pass cannot leave the queue looking busy.
struct InFlight<'a> {
    flag: &'a AtomicBool,
    status: &'a StatusBroadcaster<SyncStatus>,
}

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool, status: &'a StatusBroadcaster<SyncStatus>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { flag, status })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.status.update(|s| s.is_syncing = false);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
