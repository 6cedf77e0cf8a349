//! fieldsync: control a field device's offline sync daemon.
//!
//! # Usage
//!
//! ```text
//! fieldsync init --site <id> [--remote <url>]
//! fieldsync status [--json]
//! fieldsync sync [--critical] [--json]
//! fieldsync retry
//! fieldsync clear --yes
//! fieldsync pack check|install [--site <id>]
//! fieldsync daemon start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    init::InitArgs,
    pack::PackCommand,
    queue::{ClearArgs, RetryArgs},
    status::StatusArgs,
    sync::SyncArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "fieldsync",
    version,
    about = "Offline-first sync for field devices",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision this device for a site.
    Init(InitArgs),

    /// Show queue, site pack and day-lock state from the running daemon.
    Status(StatusArgs),

    /// Replay queued mutations now.
    Sync(SyncArgs),

    /// Reset failed mutations to pending and replay them.
    Retry(RetryArgs),

    /// Discard failed mutations without replaying them.
    Clear(ClearArgs),

    /// Check for or install the site's reference data pack.
    Pack {
        #[command(subcommand)]
        command: PackCommand,
    },

    /// Run or control the background sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Retry(args) => args.run(),
        Commands::Clear(args) => args.run(),
        Commands::Pack { command } => commands::pack::run(command),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
