//! `fieldsync status`: queue, site pack and day-lock visibility.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use fieldsync_core::{PriorityClass, SitePackStatus, SyncStatus};
use fieldsync_daemon::{request_status, DaemonError};

use super::home_dir;

/// Arguments for `fieldsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let raw = match request_status(&home) {
            Ok(raw) => raw,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                return print_not_running(self.json);
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&raw).context("failed to render status JSON")?
            );
            return Ok(());
        }

        let report: DaemonStatus =
            serde_json::from_value(raw).context("unexpected daemon status shape")?;
        print_report(&report);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DaemonStatus {
    started_at: DateTime<Utc>,
    connected: bool,
    #[serde(default)]
    site_id: Option<String>,
    queue: SyncStatus,
    #[serde(default)]
    failed: Vec<FailedEntry>,
    site_pack: SitePackStatus,
    #[serde(default)]
    entities: Vec<EntityLine>,
    #[serde(default)]
    subscriptions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FailedEntry {
    priority: PriorityClass,
    target_path: String,
    attempt_count: u32,
    #[serde(default)]
    last_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntityLine {
    id: String,
    unit: String,
    completed_today: f64,
    cumulative_completed: f64,
    locked: bool,
}

#[derive(Tabled)]
struct ClassRow {
    #[tabled(rename = "class")]
    class: String,
    #[tabled(rename = "pending")]
    pending: usize,
}

#[derive(Tabled)]
struct FailedRow {
    #[tabled(rename = "class")]
    class: String,
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "attempts")]
    attempts: u32,
    #[tabled(rename = "last error")]
    last_error: String,
}

#[derive(Tabled)]
struct EntityRow {
    #[tabled(rename = "entity")]
    entity: String,
    #[tabled(rename = "today")]
    today: String,
    #[tabled(rename = "cumulative")]
    cumulative: String,
    #[tabled(rename = "day")]
    day: String,
}

fn print_not_running(json: bool) -> Result<()> {
    if json {
        let payload = serde_json::json!({ "running": false });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to render status JSON")?
        );
    } else {
        println!(
            "{} daemon is not running; start it with `fieldsync daemon start`",
            "■".bright_black().bold()
        );
    }
    Ok(())
}

fn print_report(report: &DaemonStatus) {
    let link = if report.connected {
        "online".green().bold()
    } else {
        "offline".yellow().bold()
    };
    println!(
        "fieldsync v{} | {} | site {} | up {}",
        env!("CARGO_PKG_VERSION"),
        link,
        report.site_id.as_deref().unwrap_or("(none)"),
        format_age(report.started_at),
    );

    let separator = "■".repeat(60).bright_black().to_string();
    println!("{separator}");
    print_queue(&report.queue, &report.failed);
    println!("{separator}");
    print_site_pack(&report.site_pack);
    println!("{separator}");
    print_entities(&report.entities);
    if !report.subscriptions.is_empty() {
        println!("live documents: {}", report.subscriptions.join(", "));
    }
}

fn print_queue(queue: &SyncStatus, failed: &[FailedEntry]) {
    let syncing = if queue.is_syncing {
        " (syncing)".cyan().to_string()
    } else {
        String::new()
    };
    println!(
        "{} pending, {} failed{syncing}",
        queue.pending_count,
        failed_count(queue.failed_count),
    );
    println!(
        "last critical sync: {} | last full sync: {}",
        age_or_never(queue.last_critical_sync_at),
        age_or_never(queue.last_full_sync_at),
    );

    let rows: Vec<ClassRow> = PriorityClass::ALL
        .iter()
        .map(|class| ClassRow {
            class: class.to_string(),
            pending: queue.count_for(*class),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if failed.is_empty() {
        return;
    }
    let rows: Vec<FailedRow> = failed
        .iter()
        .map(|entry| FailedRow {
            class: entry.priority.to_string(),
            path: entry.target_path.clone(),
            attempts: entry.attempt_count,
            last_error: entry.last_error.clone().unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!(
        "Run 'fieldsync retry' to replay failed mutations or 'fieldsync clear --yes' to drop them."
    );
}

fn print_site_pack(status: &SitePackStatus) {
    let version = status
        .installed_version
        .map(|v| format!("v{v}"))
        .unwrap_or_else(|| "none installed".to_string());
    let state = if status.is_updating {
        "updating".cyan().to_string()
    } else {
        "idle".to_string()
    };
    println!(
        "site pack: {version} ({state}) | checked {} | updated {}",
        age_or_never(status.last_check_time),
        age_or_never(status.last_update_time),
    );
    if let Some(err) = status.last_error.as_deref() {
        println!("  {} {err}", "last error:".red());
    }
}

fn print_entities(entities: &[EntityLine]) {
    if entities.is_empty() {
        println!("No tracked entities.");
        return;
    }
    let rows: Vec<EntityRow> = entities
        .iter()
        .map(|e| EntityRow {
            entity: e.id.clone(),
            today: format!("{} {}", trim_float(e.completed_today), e.unit),
            cumulative: format!("{} {}", trim_float(e.cumulative_completed), e.unit),
            day: if e.locked {
                "LOCKED".to_string()
            } else {
                "open".to_string()
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn failed_count(count: usize) -> String {
    if count == 0 {
        count.to_string()
    } else {
        count.to_string().red().bold().to_string()
    }
}

fn trim_float(value: f64) -> String {
    let rendered = format!("{value:.2}");
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn age_or_never(at: Option<DateTime<Utc>>) -> String {
    at.map(format_age).unwrap_or_else(|| "never".to_string())
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
