//! `fieldsync retry` / `fieldsync clear`: act on mutations past the retry
//! ceiling.

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;

use fieldsync_daemon::{request_clear, request_retry};

use super::{daemon_call, home_dir, sync::print_report};

/// Arguments for `fieldsync retry`.
#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Emit the raw pass report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RetryArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let report = daemon_call(request_retry(&home), "retry request failed")?;
        print_report(&report, self.json)
    }
}

/// Arguments for `fieldsync clear`.
#[derive(Args, Debug)]
pub struct ClearArgs {
    /// Confirm that failed mutations are discarded for good.
    #[arg(long)]
    pub yes: bool,
}

impl ClearArgs {
    pub fn run(self) -> Result<()> {
        if !self.yes {
            bail!("clearing discards failed mutations permanently; re-run with --yes to confirm");
        }
        let home = home_dir()?;
        let data = daemon_call(request_clear(&home), "clear request failed")?;
        let cleared = data.get("cleared").and_then(|v| v.as_u64()).unwrap_or(0);
        if cleared == 0 {
            println!("No failed mutations to clear.");
        } else {
            println!("{} Discarded {cleared} failed mutation(s)", "✓".green());
        }
        Ok(())
    }
}
