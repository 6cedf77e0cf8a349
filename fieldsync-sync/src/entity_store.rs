//! Local persistence for tracked entities and their day history.
//!
//! ```text
//! entities/_index            ["job-7", …]
//! entities/<id>              TrackedEntity
//! history/<id>/_index        ["2024-01-10", …]
//! history/<id>/<YYYY-MM-DD>  DayHistorySnapshot (write-once)
//! ```

use std::sync::Arc;

use chrono::NaiveDate;

use fieldsync_core::{DayHistorySnapshot, EntityId, TrackedEntity};

use crate::error::SyncError;
use crate::store::{read_record, read_record_or_absent, write_record, LocalStore};

const ENTITY_INDEX_KEY: &str = "entities/_index";

pub fn entity_key(id: &EntityId) -> String {
    format!("entities/{id}")
}

pub fn history_key(id: &EntityId, date: NaiveDate) -> String {
    format!("history/{id}/{}", date.format("%Y-%m-%d"))
}

fn history_index_key(id: &EntityId) -> String {
    format!("history/{id}/_index")
}

#[derive(Clone)]
pub struct EntityStore {
    local: Arc<dyn LocalStore>,
}

impl EntityStore {
    pub fn new(local: Arc<dyn LocalStore>) -> Self {
        Self { local }
    }

    pub async fn load(&self, id: &EntityId) -> Result<Option<TrackedEntity>, SyncError> {
        read_record(self.local.as_ref(), &entity_key(id)).await
    }

    pub async fn require(&self, id: &EntityId) -> Result<TrackedEntity, SyncError> {
        self.load(id)
            .await?
            .ok_or_else(|| SyncError::EntityNotFound(id.clone()))
    }

    /// Write `entity` and make sure it is listed in the index.
    pub async fn save(&self, entity: &TrackedEntity) -> Result<(), SyncError> {
        write_record(self.local.as_ref(), &entity_key(&entity.id), entity).await?;
        let mut ids: Vec<EntityId> = read_record(self.local.as_ref(), ENTITY_INDEX_KEY)
            .await?
            .unwrap_or_default();
        if !ids.contains(&entity.id) {
            ids.push(entity.id.clone());
            ids.sort();
            write_record(self.local.as_ref(), ENTITY_INDEX_KEY, &ids).await?;
        }
        Ok(())
    }

    pub async fn ids(&self) -> Vec<EntityId> {
        read_record_or_absent(self.local.as_ref(), ENTITY_INDEX_KEY)
            .await
            .unwrap_or_default()
    }

    pub async fn snapshot(
        &self,
        id: &EntityId,
        date: NaiveDate,
    ) -> Result<Option<DayHistorySnapshot>, SyncError> {
        read_record(self.local.as_ref(), &history_key(id, date)).await
    }

    /// All snapshots for `id`, oldest first. Read failures are surfaced so a
    /// caller never sums an incomplete history.
    pub async fn history(&self, id: &EntityId) -> Result<Vec<DayHistorySnapshot>, SyncError> {
        let dates: Vec<NaiveDate> = read_record(self.local.as_ref(), &history_index_key(id))
            .await?
            .unwrap_or_default();
        let mut snapshots = Vec::with_capacity(dates.len());
        for date in dates {
            match self.snapshot(id, date).await? {
                Some(snapshot) => snapshots.push(snapshot),
                None => tracing::warn!(entity = %id, %date, "indexed history snapshot missing"),
            }
        }
        snapshots.sort_by_key(|s| s.date);
        Ok(snapshots)
    }

    /// Store `snapshot` unless one already exists for its date. Returns
    /// `true` when this call wrote it. The date index is repaired either way,
    /// so a retry after a partial write converges.
    pub async fn write_snapshot_once(
        &self,
        snapshot: &DayHistorySnapshot,
    ) -> Result<bool, SyncError> {
        let id = &snapshot.entity_id;
        let written = match self.snapshot(id, snapshot.date).await? {
            Some(_) => false,
            None => {
                write_record(
                    self.local.as_ref(),
                    &history_key(id, snapshot.date),
                    snapshot,
                )
                .await?;
                true
            }
        };

        let index_key = history_index_key(id);
        let mut dates: Vec<NaiveDate> = read_record(self.local.as_ref(), &index_key)
            .await?
            .unwrap_or_default();
        if !dates.contains(&snapshot.date) {
            dates.push(snapshot.date);
            dates.sort();
            write_record(self.local.as_ref(), &index_key, &dates).await?;
        }
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
