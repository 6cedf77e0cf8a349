use std::path::{Path, PathBuf};

use fieldsync_core::config;

pub const DAEMON_SOCKET: &str = "daemon.sock";

/// `<home>/.fieldsync/`
pub fn fieldsync_root(home: &Path) -> PathBuf {
    config::root_at(home)
}

/// `<home>/.fieldsync/daemon.sock`
pub fn socket_path(home: &Path) -> PathBuf {
    fieldsync_root(home).join(DAEMON_SOCKET)
}

/// `<home>/.fieldsync/data/`
pub fn data_dir(home: &Path) -> PathBuf {
    config::data_dir_at(home)
}
