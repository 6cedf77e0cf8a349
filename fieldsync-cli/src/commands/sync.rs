//! `fieldsync sync`: ask the daemon for an immediate replay pass.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;

use fieldsync_core::{SyncMode, SyncStatus};
use fieldsync_daemon::request_sync;

use super::{daemon_call, home_dir};

/// Arguments for `fieldsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Replay only P0 (safety-critical) mutations.
    #[arg(long)]
    pub critical: bool,

    /// Emit the raw pass report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let mode = if self.critical {
            SyncMode::Critical
        } else {
            SyncMode::Full
        };
        let report = daemon_call(request_sync(&home, mode), "sync request failed")?;
        print_report(&report, self.json)
    }
}

/// The subset of a pass report the CLI renders.
#[derive(Debug, Deserialize)]
pub(crate) struct PassReport {
    pub mode: SyncMode,
    #[serde(default)]
    pub skipped: Option<String>,
    #[serde(default)]
    pub succeeded: Vec<String>,
    #[serde(default)]
    pub retrying: Vec<String>,
    #[serde(default)]
    pub demoted: Vec<String>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub persist_error: Option<String>,
    pub status: SyncStatus,
}

pub(crate) fn print_report(raw: &Value, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(raw).context("failed to render sync report JSON")?
        );
        return Ok(());
    }

    let report: PassReport =
        serde_json::from_value(raw.clone()).context("unexpected sync report shape")?;
    if let Some(reason) = report.skipped.as_deref() {
        println!("{} {} pass skipped ({reason})", "•".yellow(), report.mode);
        return Ok(());
    }

    println!(
        "{} {} pass: {} sent, {} retrying, {} failed",
        "✓".green(),
        report.mode,
        report.succeeded.len(),
        report.retrying.len(),
        report.demoted.len(),
    );
    if report.interrupted {
        println!(
            "  {}",
            "connection dropped mid-pass; remaining entries wait for reconnect".yellow()
        );
    }
    if let Some(err) = report.persist_error.as_deref() {
        println!(
            "  {} {err}",
            "queue not saved after dispatch; sent entries may replay:".red()
        );
    }
    println!(
        "  queue: {} pending, {} failed",
        report.status.pending_count, report.status.failed_count
    );
    Ok(())
}
