//! Device configuration stored as YAML.
//!
//! # Storage layout
//!
//! ```text
//! ~/.fieldsync/
//!   config.yaml   (mode 0600)
//!   data/         (local durable store, one JSON file per key)
//! ```
//!
//! # API pattern
//!
//! Every function that touches disk has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::SiteId;

pub const DEFAULT_RETRY_CEILING: u32 = 5;
pub const DEFAULT_TIME_LOCK_CUTOFF: &str = "23:55";

/// Tunables for one field device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<SiteId>,
    /// Base URL of the remote document endpoint. Without one the daemon runs
    /// against an in-process remote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Attempts before a queued mutation is demoted to failed.
    pub retry_ceiling: u32,
    pub connectivity_poll_secs: u64,
    pub full_sync_interval_secs: u64,
    pub day_check_interval_secs: u64,
    /// Local wall-clock time (`HH:MM`) at which an unconsumed day locks.
    pub time_lock_cutoff: String,
    pub init_timeout_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            site_id: None,
            remote_url: None,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            connectivity_poll_secs: 5,
            full_sync_interval_secs: 300,
            day_check_interval_secs: 60,
            time_lock_cutoff: DEFAULT_TIME_LOCK_CUTOFF.to_string(),
            init_timeout_ms: 3_000,
            http_timeout_secs: 15,
        }
    }
}

impl DeviceConfig {
    /// Parsed `time_lock_cutoff`.
    pub fn cutoff(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.time_lock_cutoff.trim(), "%H:%M").map_err(|e| {
            ConfigError::Invalid {
                field: "time_lock_cutoff",
                reason: format!("expected HH:MM, got '{}' ({e})", self.time_lock_cutoff),
            }
        })
    }

    pub fn connectivity_poll(&self) -> Duration {
        Duration::from_secs(self.connectivity_poll_secs.max(1))
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_secs.max(1))
    }

    pub fn day_check_interval(&self) -> Duration {
        Duration::from_secs(self.day_check_interval_secs.max(1))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_ceiling == 0 {
            return Err(ConfigError::Invalid {
                field: "retry_ceiling",
                reason: "must be at least 1".to_string(),
            });
        }
        self.cutoff()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.fieldsync/`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".fieldsync")
}

/// `<home>/.fieldsync/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

/// `<home>/.fieldsync/data/`, the local durable store root.
pub fn data_dir_at(home: &Path) -> PathBuf {
    root_at(home).join("data")
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load the config, falling back to defaults when the file is absent.
///
/// Returns `ConfigError::Parse` (with path) for malformed YAML and
/// `ConfigError::Invalid` for values out of range.
pub fn load_at(home: &Path) -> Result<DeviceConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(DeviceConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: DeviceConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<DeviceConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &DeviceConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let root = root_at(home);
    if !root.exists() {
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &DeviceConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Provision a device for `site_id`.
///
/// Idempotent for the site: an existing config keeps its tunables and only
/// has `site_id` / `remote_url` replaced.
pub fn init_at(
    home: &Path,
    site_id: SiteId,
    remote_url: Option<String>,
) -> Result<DeviceConfig, ConfigError> {
    let mut config = load_at(home)?;
    config.site_id = Some(site_id);
    if remote_url.is_some() {
        config.remote_url = remote_url;
    }
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(site_id: SiteId, remote_url: Option<String>) -> Result<DeviceConfig, ConfigError> {
    init_at(&home()?, site_id, remote_url)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
