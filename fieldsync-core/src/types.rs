//! Domain types for the offline sync subsystem.
//!
//! Instants are `DateTime<Utc>`. Anything that answers "which day does this
//! figure belong to" is a device-local `NaiveDate`, because the day boundary
//! is defined by the device wall clock.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier assigned to a queued mutation at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeId(pub String);

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EnvelopeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a business entity that carries a completed-today counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of the site a device is provisioned for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteId(pub String);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SiteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Write queue
// ---------------------------------------------------------------------------

/// Replay priority of a queued mutation. `P0` is replayed first.
///
/// The subsystem attaches no business meaning to the classes; callers pick
/// one at enqueue time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum PriorityClass {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 4] = [Self::P0, Self::P1, Self::P2, Self::P3];

    /// Classes replayed by a critical pass.
    pub fn is_critical(self) -> bool {
        self == Self::P0
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityClass::P0 => write!(f, "P0"),
            PriorityClass::P1 => write!(f, "P1"),
            PriorityClass::P2 => write!(f, "P2"),
            PriorityClass::P3 => write!(f, "P3"),
        }
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            "P3" => Ok(Self::P3),
            other => Err(format!(
                "unknown priority class '{other}'; expected: P0, P1, P2, P3"
            )),
        }
    }
}

/// Kind of remote write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Replay outcome of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

/// Which classes a replay pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// `P0` only.
    Critical,
    /// `P0` through `P3`, in class order.
    Full,
}

impl SyncMode {
    pub fn covers(self, priority: PriorityClass) -> bool {
        match self {
            SyncMode::Critical => priority.is_critical(),
            SyncMode::Full => true,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Critical => write!(f, "critical"),
            SyncMode::Full => write!(f, "full"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "full" => Ok(Self::Full),
            other => Err(format!(
                "unknown sync mode '{other}'; expected: critical, full"
            )),
        }
    }
}

/// Caller input to `enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub priority: PriorityClass,
    pub target_path: String,
    pub operation: OperationKind,
    #[serde(default)]
    pub payload: Value,
}

impl MutationRequest {
    pub fn new(
        priority: PriorityClass,
        target_path: impl Into<String>,
        operation: OperationKind,
        payload: Value,
    ) -> Self {
        Self {
            priority,
            target_path: target_path.into(),
            operation,
            payload,
        }
    }
}

/// A locally-originated mutation waiting to be replayed against the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    pub id: EnvelopeId,
    /// Enqueue order; FIFO within a class is decided by this, not by clock.
    pub seq: u64,
    pub priority: PriorityClass,
    pub target_path: String,
    pub operation: OperationKind,
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub outcome: Outcome,
}

impl MutationEnvelope {
    pub fn is_pending(&self) -> bool {
        self.outcome == Outcome::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }
}

/// Queue counters broadcast to status listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncStatus {
    pub pending_count: usize,
    pub failed_count: usize,
    pub is_syncing: bool,
    pub p0_count: usize,
    pub p1_count: usize,
    pub p2_count: usize,
    pub p3_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_critical_sync_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    /// Recompute every count from `entries`. Per-class counts cover pending
    /// entries only.
    pub fn recount(&mut self, entries: &[MutationEnvelope]) {
        self.pending_count = 0;
        self.failed_count = 0;
        self.p0_count = 0;
        self.p1_count = 0;
        self.p2_count = 0;
        self.p3_count = 0;
        for entry in entries {
            match entry.outcome {
                Outcome::Pending => {
                    self.pending_count += 1;
                    match entry.priority {
                        PriorityClass::P0 => self.p0_count += 1,
                        PriorityClass::P1 => self.p1_count += 1,
                        PriorityClass::P2 => self.p2_count += 1,
                        PriorityClass::P3 => self.p3_count += 1,
                    }
                }
                Outcome::Failed => self.failed_count += 1,
                Outcome::Succeeded => {}
            }
        }
    }

    pub fn count_for(&self, priority: PriorityClass) -> usize {
        match priority {
            PriorityClass::P0 => self.p0_count,
            PriorityClass::P1 => self.p1_count,
            PriorityClass::P2 => self.p2_count,
            PriorityClass::P3 => self.p3_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Freshness
// ---------------------------------------------------------------------------

/// Where an arbitrated copy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Remote,
    Cache,
    Merged,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Remote => write!(f, "remote"),
            DataSource::Cache => write!(f, "cache"),
            DataSource::Merged => write!(f, "merged"),
        }
    }
}

/// A write timestamp as observed on one side of an arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Stamp {
    /// No copy has ever been written.
    Never,
    At(DateTime<Utc>),
    /// Text that could not be read as a timestamp.
    Unparsed(String),
}

impl Stamp {
    /// Read RFC 3339 text or integer epoch milliseconds.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
            return Stamp::At(at.with_timezone(&Utc));
        }
        if let Ok(millis) = trimmed.parse::<i64>() {
            if let Some(at) = Utc.timestamp_millis_opt(millis).single() {
                return Stamp::At(at);
            }
        }
        Stamp::Unparsed(raw.to_string())
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Stamp::At(at) => Some(*at),
            Stamp::Never | Stamp::Unparsed(_) => None,
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stamp::Never => write!(f, "never"),
            Stamp::At(at) => write!(f, "{}", at.to_rfc3339()),
            Stamp::Unparsed(raw) => write!(f, "{raw}"),
        }
    }
}

/// Result of a freshness arbitration for a single logical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEntity<T> {
    pub data: Option<T>,
    pub source: DataSource,
    pub timestamp: Stamp,
    pub is_fresh: bool,
}

impl<T> TimestampedEntity<T> {
    /// Sentinel returned when neither side holds a copy.
    pub fn empty() -> Self {
        Self {
            data: None,
            source: DataSource::Cache,
            timestamp: Stamp::Never,
            is_fresh: false,
        }
    }
}

/// Connectivity as reported by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Connectivity {
    pub is_connected: bool,
}

// ---------------------------------------------------------------------------
// Day-boundary lock
// ---------------------------------------------------------------------------

/// Which completion trigger froze the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    /// A downstream quality check consumed today's figure.
    QcInteraction,
    /// Nobody consumed the figure before the end-of-day cutoff.
    TimeLock,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::QcInteraction => write!(f, "QC_INTERACTION"),
            LockType::TimeLock => write!(f, "TIME_LOCK"),
        }
    }
}

/// Lock state embedded on a [`TrackedEntity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompletedTodayLock {
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_type: Option<LockType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_unit: Option<String>,
    /// Device-local day the lock applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_approved_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_approved_unit: Option<String>,
}

/// Dependent workflow status that a rollover resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QcStatus {
    #[default]
    NotRequested,
    Requested,
    Completed,
}

/// A business entity carrying a completed-today counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: EntityId,
    pub unit: String,
    #[serde(default)]
    pub completed_today: f64,
    #[serde(default)]
    pub cumulative_completed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_scope: Option<f64>,
    #[serde(default)]
    pub scope_approved: bool,
    #[serde(default)]
    pub qc_status: QcStatus,
    /// External QC-completion signal: the local day QC last completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_completed_on: Option<NaiveDate>,
    #[serde(default)]
    pub lock: CompletedTodayLock,
    pub updated_at: DateTime<Utc>,
}

impl TrackedEntity {
    pub fn new(id: impl Into<EntityId>, unit: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unit: unit.into(),
            completed_today: 0.0,
            cumulative_completed: 0.0,
            approved_scope: None,
            scope_approved: false,
            qc_status: QcStatus::default(),
            qc_completed_on: None,
            lock: CompletedTodayLock::default(),
            updated_at: Utc::now(),
        }
    }
}

/// Progress against approved scope, or `Unknown` when scope is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Percentage {
    Known(f64),
    Unknown,
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Percentage::Known(value) => write!(f, "{value:.1}%"),
            Percentage::Unknown => write!(f, "unknown"),
        }
    }
}

/// Immutable record of one closed day for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayHistorySnapshot {
    pub entity_id: EntityId,
    pub date: NaiveDate,
    pub completed_value: f64,
    pub unit: String,
    pub lock_type: LockType,
    /// Sum of every earlier snapshot plus this day.
    pub history_total: f64,
    pub cumulative_before: f64,
    pub cumulative_after: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_scope: Option<f64>,
    pub scope_approved: bool,
    pub unverified_percentage: Percentage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_approved_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_approved_unit: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Site pack
// ---------------------------------------------------------------------------

/// A versioned bulk dataset that seeds a device for offline operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitePack {
    pub version: u64,
    pub site_id: SiteId,
    pub generated_at: DateTime<Utc>,
    /// Hex SHA-256 of the JSON encoding of `datasets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub datasets: BTreeMap<String, Value>,
}

/// Lightweight descriptor published next to each pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitePackManifest {
    pub version: u64,
    pub generated_at: DateTime<Utc>,
}

/// Bootstrap status, persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SitePackStatus {
    pub is_updating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<u64>,
}

/// Answer to "is there a newer pack for this site?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateCheck {
    NoUpdate,
    Available { version: u64 },
}

/// Result of an install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallOutcome {
    pub fn installed(version: u64) -> Self {
        Self {
            success: true,
            version: Some(version),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            version: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn envelope(seq: u64, priority: PriorityClass, outcome: Outcome) -> MutationEnvelope {
        MutationEnvelope {
            id: EnvelopeId::from(format!("e-{seq}")),
            seq,
            priority,
            target_path: "jobs/1".to_string(),
            operation: OperationKind::Update,
            payload: json!({}),
            enqueued_at: Utc::now(),
            attempt_count: 0,
            last_error: None,
            outcome,
        }
    }

    #[test]
    fn newtype_display() {
        assert_eq!(EnvelopeId::from("e-1").to_string(), "e-1");
        assert_eq!(EntityId::from("job-9").to_string(), "job-9");
        assert_eq!(SiteId::from("north").to_string(), "north");
    }

    #[test]
    fn priority_classes_order_p0_first() {
        let mut classes = vec![
            PriorityClass::P3,
            PriorityClass::P0,
            PriorityClass::P2,
            PriorityClass::P1,
        ];
        classes.sort();
        assert_eq!(classes, PriorityClass::ALL.to_vec());
    }

    #[rstest]
    #[case("p0", PriorityClass::P0)]
    #[case("P3", PriorityClass::P3)]
    fn priority_class_parses(#[case] raw: &str, #[case] expected: PriorityClass) {
        assert_eq!(raw.parse::<PriorityClass>().unwrap(), expected);
    }

    #[rstest]
    #[case("critical", SyncMode::Critical)]
    #[case("FULL", SyncMode::Full)]
    fn sync_mode_parses(#[case] raw: &str, #[case] expected: SyncMode) {
        assert_eq!(raw.parse::<SyncMode>().unwrap(), expected);
    }

    #[test]
    fn sync_mode_rejects_unknown() {
        let err = "partial".parse::<SyncMode>().unwrap_err();
        assert!(err.contains("partial"));
    }

    #[test]
    fn recount_tracks_pending_per_class_and_failed_separately() {
        let entries = vec![
            envelope(1, PriorityClass::P0, Outcome::Pending),
            envelope(2, PriorityClass::P0, Outcome::Failed),
            envelope(3, PriorityClass::P2, Outcome::Pending),
            envelope(4, PriorityClass::P3, Outcome::Pending),
        ];
        let mut status = SyncStatus::default();
        status.recount(&entries);
        assert_eq!(status.pending_count, 3);
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.p0_count, 1);
        assert_eq!(status.p1_count, 0);
        assert_eq!(status.count_for(PriorityClass::P2), 1);
        assert_eq!(status.p3_count, 1);
    }

    #[rstest]
    #[case("2024-01-10T08:00:00Z", true)]
    #[case("1704873600000", true)]
    #[case("yesterday-ish", false)]
    #[case("", false)]
    fn stamp_parse(#[case] raw: &str, #[case] comparable: bool) {
        assert_eq!(Stamp::parse(raw).instant().is_some(), comparable);
    }

    #[test]
    fn stamp_epoch_millis_and_rfc3339_agree() {
        let a = Stamp::parse("2024-01-10T08:00:00Z");
        let b = Stamp::parse("1704873600000");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_entity_renders_never() {
        let empty: TimestampedEntity<Value> = TimestampedEntity::empty();
        assert!(empty.data.is_none());
        assert_eq!(empty.source, DataSource::Cache);
        assert_eq!(empty.timestamp.to_string(), "never");
        assert!(!empty.is_fresh);
    }

    #[test]
    fn lock_type_serializes_screaming_case() {
        let encoded = serde_json::to_string(&LockType::QcInteraction).unwrap();
        assert_eq!(encoded, "\"QC_INTERACTION\"");
        assert_eq!(LockType::TimeLock.to_string(), "TIME_LOCK");
    }

    #[test]
    fn envelope_defaults_missing_fields_on_load() {
        let raw = json!({
            "id": "e-1",
            "seq": 1,
            "priority": "P1",
            "target_path": "jobs/1",
            "operation": "create",
            "enqueued_at": "2024-01-10T08:00:00Z"
        });
        let env: MutationEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.outcome, Outcome::Pending);
        assert_eq!(env.attempt_count, 0);
        assert!(env.last_error.is_none());
    }

    #[test]
    fn percentage_display() {
        assert_eq!(Percentage::Known(42.24).to_string(), "42.2%");
        assert_eq!(Percentage::Unknown.to_string(), "unknown");
    }
}
