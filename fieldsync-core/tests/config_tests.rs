//! Config error-message, atomic-save, and init integration tests.

use assert_fs::prelude::*;
use fieldsync_core::{
    config::{self, DeviceConfig},
    types::SiteId,
    ConfigError,
};
use predicates::prelude::predicate;
use std::fs;

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.path().join(".fieldsync");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("config.yaml"), b": : corrupt : yaml : !!!\n  - [unclosed").expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"), "got: {err}");
}

#[test]
fn wrong_type_yaml_returns_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".fieldsync/config.yaml")
        .write_str("retry_ceiling: lots\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

#[test]
fn out_of_range_value_returns_invalid() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".fieldsync/config.yaml")
        .write_str("time_lock_cutoff: \"25:99\"\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }), "got: {err}");
    assert!(err.to_string().contains("time_lock_cutoff"));
}

// ---------------------------------------------------------------------------
// 2. Save / init
// ---------------------------------------------------------------------------

#[test]
fn init_writes_site_and_keeps_tunables() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let tuned = DeviceConfig {
        retry_ceiling: 8,
        ..DeviceConfig::default()
    };
    config::save_at(home.path(), &tuned).expect("save");

    let config = config::init_at(
        home.path(),
        SiteId::from("north-yard"),
        Some("https://docs.example.test/v1".to_string()),
    )
    .expect("init");

    assert_eq!(config.retry_ceiling, 8);
    assert_eq!(config.site_id, Some(SiteId::from("north-yard")));
    home.child(".fieldsync/config.yaml")
        .assert(predicate::str::contains("north-yard"));
}

#[test]
fn init_without_url_preserves_existing_url() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::init_at(
        home.path(),
        SiteId::from("a"),
        Some("https://one.example.test".to_string()),
    )
    .expect("first init");
    let config = config::init_at(home.path(), SiteId::from("b"), None).expect("second init");

    assert_eq!(config.site_id, Some(SiteId::from("b")));
    assert_eq!(
        config.remote_url.as_deref(),
        Some("https://one.example.test")
    );
}

#[cfg(unix)]
#[test]
fn saved_config_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &DeviceConfig::default()).expect("save");
    let mode = fs::metadata(config::config_path_at(home.path()))
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}
