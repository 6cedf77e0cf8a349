//! `fieldsync pack`: site reference data pack.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::Value;

use fieldsync_core::{InstallOutcome, UpdateCheck};
use fieldsync_daemon::{request_pack_check, request_pack_install};

use super::{daemon_call, home_dir};

#[derive(Subcommand, Debug)]
pub enum PackCommand {
    /// Compare the published manifest against the installed version.
    Check(PackArgs),
    /// Download, verify and install the published pack.
    Install(PackArgs),
}

#[derive(Args, Debug)]
pub struct PackArgs {
    /// Site to use instead of the configured one.
    #[arg(long, short = 's')]
    pub site: Option<String>,
}

pub fn run(command: PackCommand) -> Result<()> {
    let home = home_dir()?;
    match command {
        PackCommand::Check(args) => {
            let data = daemon_call(request_pack_check(&home, args.site), "pack check failed")?;
            let check: UpdateCheck = serde_json::from_value(field(&data, "check"))
                .context("unexpected pack check shape")?;
            let site = data.get("site").and_then(Value::as_str).unwrap_or("?");
            match check {
                UpdateCheck::Available { version } => println!(
                    "{} version {version} is available for '{site}'; run `fieldsync pack install`",
                    "•".yellow()
                ),
                UpdateCheck::NoUpdate => {
                    println!("{} site pack for '{site}' is up to date", "✓".green())
                }
            }
        }
        PackCommand::Install(args) => {
            let data = daemon_call(request_pack_install(&home, args.site), "pack install failed")?;
            let outcome: InstallOutcome =
                serde_json::from_value(data).context("unexpected pack install shape")?;
            if !outcome.success {
                bail!(
                    "site pack install failed: {}",
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
            match outcome.version {
                Some(version) => println!("{} Installed site pack version {version}", "✓".green()),
                None => println!("{} Site pack installed", "✓".green()),
            }
        }
    }
    Ok(())
}

fn field(data: &Value, name: &str) -> Value {
    data.get(name).cloned().unwrap_or(Value::Null)
}
