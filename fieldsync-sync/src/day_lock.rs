//! Day-boundary lock over a tracked entity's "completed today" figure.
//!
//! ```text
//! UNLOCKED ──lock(QC_INTERACTION)──▶ LOCKED ──next day──▶ UNLOCKED
//! UNLOCKED ──23:55 time trigger────▶ LOCKED ──next day──▶ UNLOCKED
//! ```
//!
//! The first trigger of the day wins; QC completion always beats the time
//! trigger. Rollover writes one immutable history snapshot for the locked
//! day and only then resets the live entity, so a failed history write never
//! leaves a half-reset entity, and a failed reset is retried on the next
//! check without duplicating history.
//!
//! Every transition is a read-modify-write of the whole entity, so all of
//! them run under one async mutex held from load through save.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tokio::sync::Mutex;

use fieldsync_core::{
    CompletedTodayLock, DayHistorySnapshot, EntityId, LockType, MutationRequest, OperationKind,
    Percentage, PriorityClass, QcStatus, TrackedEntity,
};

use crate::clock::Clock;
use crate::entity_store::{entity_key, history_key, EntityStore};
use crate::error::SyncError;
use crate::store::LocalStore;
use crate::write_queue::WriteQueue;

/// Snapshot handed to [`DayBoundaryLock::lock`].
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequest {
    pub lock_type: LockType,
    pub locked_value: f64,
    pub locked_unit: String,
    pub qc_approved_value: Option<f64>,
    pub qc_approved_unit: Option<String>,
}

impl LockRequest {
    pub fn qc(value: f64, unit: impl Into<String>) -> Self {
        Self {
            lock_type: LockType::QcInteraction,
            locked_value: value,
            locked_unit: unit.into(),
            qc_approved_value: None,
            qc_approved_unit: None,
        }
    }

    pub fn time(value: f64, unit: impl Into<String>) -> Self {
        Self {
            lock_type: LockType::TimeLock,
            ..Self::qc(value, unit)
        }
    }

    pub fn with_qc_approval(mut self, value: f64, unit: impl Into<String>) -> Self {
        self.qc_approved_value = Some(value);
        self.qc_approved_unit = Some(unit.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLockOutcome {
    Applied,
    AlreadyLocked,
    /// QC completed today without a lock landing yet; the QC lock owns the day.
    QcTakesPrecedence,
    BeforeCutoff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverOutcome {
    NotLocked,
    SameDay,
    RolledOver(DayHistorySnapshot),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub rolled_over: Vec<EntityId>,
    pub time_locked: Vec<EntityId>,
    pub errors: Vec<(EntityId, String)>,
}

/// Locked for `today`: the persisted flag, or a QC completion recorded today
/// whose lock write has not landed.
pub fn is_locked_on(entity: &TrackedEntity, today: NaiveDate) -> bool {
    entity.lock.is_locked || entity.qc_completed_on == Some(today)
}

/// Progress against approved scope; `Unknown` without a usable scope.
pub fn unverified_percentage(total: f64, entity: &TrackedEntity) -> Percentage {
    match entity.approved_scope {
        Some(scope) if entity.scope_approved && scope > 0.0 => {
            Percentage::Known(total * 100.0 / scope)
        }
        _ => Percentage::Unknown,
    }
}

pub struct DayBoundaryLock {
    store: EntityStore,
    clock: Arc<dyn Clock>,
    cutoff: NaiveTime,
    outbox: Option<Arc<WriteQueue>>,
    transitions: Mutex<()>,
}

impl DayBoundaryLock {
    pub fn new(local: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, cutoff: NaiveTime) -> Self {
        Self {
            store: EntityStore::new(local),
            clock,
            cutoff,
            outbox: None,
            transitions: Mutex::new(()),
        }
    }

    /// Mirror every transition to the remote through `queue`.
    pub fn with_outbox(mut self, queue: Arc<WriteQueue>) -> Self {
        self.outbox = Some(queue);
        self
    }

    pub fn cutoff(&self) -> NaiveTime {
        self.cutoff
    }

    /// Start tracking `entity`. An already-tracked id keeps its stored state.
    pub async fn track(&self, entity: TrackedEntity) -> Result<TrackedEntity, SyncError> {
        let _transition = self.transitions.lock().await;
        if let Some(existing) = self.store.load(&entity.id).await? {
            return Ok(existing);
        }
        self.store.save(&entity).await?;
        tracing::info!(entity = %entity.id, unit = %entity.unit, "entity tracked");
        Ok(entity)
    }

    pub async fn entity(&self, id: &EntityId) -> Result<TrackedEntity, SyncError> {
        self.store.require(id).await
    }

    pub async fn tracked_ids(&self) -> Vec<EntityId> {
        self.store.ids().await
    }

    pub async fn history(&self, id: &EntityId) -> Result<Vec<DayHistorySnapshot>, SyncError> {
        self.store.history(id).await
    }

    pub async fn is_locked(&self, id: &EntityId) -> Result<bool, SyncError> {
        let entity = self.store.require(id).await?;
        Ok(is_locked_on(&entity, self.clock.today()))
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// UNLOCKED → LOCKED for today.
    pub async fn lock(
        &self,
        id: &EntityId,
        request: LockRequest,
    ) -> Result<TrackedEntity, SyncError> {
        let _transition = self.transitions.lock().await;
        let entity = self.store.require(id).await?;
        self.lock_loaded(entity, request).await
    }

    /// Caller holds `transitions` and loaded `entity` under it.
    async fn lock_loaded(
        &self,
        mut entity: TrackedEntity,
        request: LockRequest,
    ) -> Result<TrackedEntity, SyncError> {
        let id = entity.id.clone();
        let today = self.clock.today();
        if entity.lock.is_locked {
            return Err(SyncError::AlreadyLocked {
                entity: id,
                date: entity.lock.lock_date.unwrap_or(today),
            });
        }

        let now = self.clock.utc_now();
        entity.lock = CompletedTodayLock {
            is_locked: true,
            lock_type: Some(request.lock_type),
            locked_at: Some(now),
            locked_value: Some(request.locked_value),
            locked_unit: Some(request.locked_unit),
            lock_date: Some(today),
            qc_approved_value: request.qc_approved_value,
            qc_approved_unit: request.qc_approved_unit,
        };
        if request.lock_type == LockType::QcInteraction {
            entity.qc_completed_on = Some(today);
            entity.qc_status = QcStatus::Completed;
        }
        entity.updated_at = now;
        self.store.save(&entity).await?;

        tracing::info!(
            entity = %id,
            lock_type = %request.lock_type,
            value = request.locked_value,
            %today,
            "day locked"
        );
        self.mirror(
            PriorityClass::P0,
            entity_key(&id),
            OperationKind::Update,
            &entity,
        )
        .await;
        Ok(entity)
    }

    /// Apply the time trigger once the cutoff has passed.
    pub async fn check_and_apply_time_lock(
        &self,
        id: &EntityId,
        current_value: f64,
        current_unit: &str,
    ) -> Result<TimeLockOutcome, SyncError> {
        let _transition = self.transitions.lock().await;
        let entity = self.store.require(id).await?;
        self.time_lock_loaded(entity, Some((current_value, current_unit)))
            .await
    }

    /// Time trigger over an entity loaded under `transitions`. Without an
    /// explicit figure the stored `completed_today` is frozen.
    async fn time_lock_loaded(
        &self,
        entity: TrackedEntity,
        current: Option<(f64, &str)>,
    ) -> Result<TimeLockOutcome, SyncError> {
        let id = &entity.id;
        let now = self.clock.local_now();
        if entity.lock.is_locked {
            return Ok(TimeLockOutcome::AlreadyLocked);
        }
        if entity.qc_completed_on == Some(now.date()) {
            tracing::debug!(entity = %id, "QC completed today; time lock skipped");
            return Ok(TimeLockOutcome::QcTakesPrecedence);
        }
        if now.time() < self.cutoff {
            return Ok(TimeLockOutcome::BeforeCutoff);
        }

        let request = match current {
            Some((value, unit)) => LockRequest::time(value, unit),
            None => LockRequest::time(entity.completed_today, entity.unit.clone()),
        };
        self.lock_loaded(entity, request).await?;
        Ok(TimeLockOutcome::Applied)
    }

    /// Roll a lock from an earlier day into history and reset the entity.
    pub async fn check_and_unlock_new_day(
        &self,
        id: &EntityId,
    ) -> Result<RolloverOutcome, SyncError> {
        let _transition = self.transitions.lock().await;
        let mut entity = self.store.require(id).await?;
        let today = self.clock.today();
        if !entity.lock.is_locked {
            return Ok(RolloverOutcome::NotLocked);
        }
        let Some(lock_date) = entity.lock.lock_date else {
            tracing::warn!(entity = %id, "lock without a lock date; treating as today's");
            return Ok(RolloverOutcome::SameDay);
        };
        if lock_date == today {
            return Ok(RolloverOutcome::SameDay);
        }

        let locked_value = entity.lock.locked_value.unwrap_or(entity.completed_today);
        let prior_total: f64 = self
            .store
            .history(id)
            .await?
            .iter()
            .filter(|s| s.date != lock_date)
            .map(|s| s.completed_value)
            .sum();
        let history_total = prior_total + locked_value;
        let cumulative_before = entity.cumulative_completed;
        let cumulative_after = cumulative_before + locked_value;
        let now = self.clock.utc_now();

        let candidate = DayHistorySnapshot {
            entity_id: id.clone(),
            date: lock_date,
            completed_value: locked_value,
            unit: entity
                .lock
                .locked_unit
                .clone()
                .unwrap_or_else(|| entity.unit.clone()),
            lock_type: entity.lock.lock_type.unwrap_or(LockType::TimeLock),
            history_total,
            cumulative_before,
            cumulative_after,
            approved_scope: entity.approved_scope,
            scope_approved: entity.scope_approved,
            unverified_percentage: unverified_percentage(history_total, &entity),
            qc_approved_value: entity.lock.qc_approved_value,
            qc_approved_unit: entity.lock.qc_approved_unit.clone(),
            recorded_at: now,
        };

        // History first. If this fails nothing below runs.
        let written = self.store.write_snapshot_once(&candidate).await?;
        let snapshot = if written {
            candidate
        } else {
            tracing::info!(entity = %id, date = %lock_date, "history already recorded; resuming reset");
            self.store
                .snapshot(id, lock_date)
                .await?
                .unwrap_or(candidate)
        };

        entity.lock = CompletedTodayLock::default();
        entity.qc_status = QcStatus::NotRequested;
        entity.completed_today = 0.0;
        entity.cumulative_completed = cumulative_after;
        entity.updated_at = now;
        self.store.save(&entity).await?;

        tracing::info!(
            entity = %id,
            date = %lock_date,
            value = snapshot.completed_value,
            cumulative = cumulative_after,
            "day rolled over"
        );
        // Also on a resumed reset: the attempt that wrote the snapshot never
        // reached this point, and a remote create of the same path is idempotent.
        self.mirror(
            PriorityClass::P1,
            history_key(id, lock_date),
            OperationKind::Create,
            &snapshot,
        )
        .await;
        self.mirror(
            PriorityClass::P0,
            entity_key(id),
            OperationKind::Update,
            &entity,
        )
        .await;
        Ok(RolloverOutcome::RolledOver(snapshot))
    }

    // -----------------------------------------------------------------------
    // Live figure
    // -----------------------------------------------------------------------

    /// Set today's figure. Rejected once the day is frozen.
    pub async fn record_progress(
        &self,
        id: &EntityId,
        completed_today: f64,
    ) -> Result<TrackedEntity, SyncError> {
        let _transition = self.transitions.lock().await;
        let mut entity = self.store.require(id).await?;
        if is_locked_on(&entity, self.clock.today()) {
            return Err(SyncError::Frozen(id.clone()));
        }
        entity.completed_today = completed_today;
        entity.updated_at = self.clock.utc_now();
        self.store.save(&entity).await?;
        self.mirror(
            PriorityClass::P2,
            entity_key(id),
            OperationKind::Update,
            &entity,
        )
        .await;
        Ok(entity)
    }

    /// Record the external QC-completion signal without locking. The QC lock
    /// itself is expected to follow through [`DayBoundaryLock::lock`].
    pub async fn note_qc_completed(&self, id: &EntityId) -> Result<TrackedEntity, SyncError> {
        let _transition = self.transitions.lock().await;
        let mut entity = self.store.require(id).await?;
        entity.qc_completed_on = Some(self.clock.today());
        entity.qc_status = QcStatus::Completed;
        entity.updated_at = self.clock.utc_now();
        self.store.save(&entity).await?;
        Ok(entity)
    }

    /// Unlock-then-time-lock check across every tracked entity.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for id in self.store.ids().await {
            match self.check_and_unlock_new_day(&id).await {
                Ok(RolloverOutcome::RolledOver(_)) => report.rolled_over.push(id.clone()),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(entity = %id, error = %err, "rollover check failed");
                    report.errors.push((id.clone(), err.to_string()));
                    continue;
                }
            }

            match self.time_lock_stored(&id).await {
                Ok(TimeLockOutcome::Applied) => report.time_locked.push(id),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(entity = %id, error = %err, "time lock check failed");
                    report.errors.push((id, err.to_string()));
                }
            }
        }
        report
    }

    async fn time_lock_stored(&self, id: &EntityId) -> Result<TimeLockOutcome, SyncError> {
        let _transition = self.transitions.lock().await;
        let entity = self.store.require(id).await?;
        self.time_lock_loaded(entity, None).await
    }

    async fn mirror<T: Serialize>(
        &self,
        priority: PriorityClass,
        path: String,
        operation: OperationKind,
        record: &T,
    ) {
        let Some(queue) = &self.outbox else {
            return;
        };
        let payload = match serde_json::to_value(record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "outbox payload not serializable");
                return;
            }
        };
        let request = MutationRequest::new(priority, path, operation, payload);
        if let Err(err) = queue.enqueue(request).await {
            tracing::warn!(error = %err, "outbox enqueue failed; remote copy will lag");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
