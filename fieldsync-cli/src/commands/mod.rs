pub mod daemon;
pub mod init;
pub mod pack;
pub mod queue;
pub mod status;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use fieldsync_daemon::DaemonError;

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Attach a start hint when the daemon is down.
pub(crate) fn daemon_call<T>(result: Result<T, DaemonError>, action: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err @ DaemonError::DaemonNotRunning { .. }) => {
            Err(err).context(format!("{action}: start it with `fieldsync daemon start`"))
        }
        Err(err) => Err(err).context(action.to_string()),
    }
}
