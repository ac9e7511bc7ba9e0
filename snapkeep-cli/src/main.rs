/*!
Snapkeep CLI - admin surface for the snapkeep snapshot system.

Creates, lists, restores and prunes snapshots of the application's primary data
file, edits the snapshot settings, and can run the daily scheduler in the
foreground until interrupted.
*/

use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use snapkeep_core::config::{self, KNOWN_KEYS};
use snapkeep_core::{
    init_observability, JsonFileRepository, JsonFileSettings, LogFormat, Scheduler,
    SchedulerOptions, SettingsProvider, Snapshot, SnapshotConfig, SnapshotEngine, SnapshotError,
    SnapshotKind,
};
use snapkeep_retry::RetryPolicy;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{debug, error, info};

type Engine = SnapshotEngine<JsonFileRepository, JsonFileSettings>;

const SETTINGS_FILE: &str = "settings.json";
const INDEX_FILE: &str = "snapshot_index.json";
const DEFAULT_DATA_FILE: &str = "app.db";

#[derive(Parser)]
#[command(name = "snapkeep")]
#[command(about = "Scheduled snapshots of an application's data file")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Application root holding settings, index and snapshots
    #[arg(short, long, global = true, env = "SNAPKEEP_ROOT", default_value = ".")]
    root: PathBuf,

    /// Primary data file to protect (defaults to <root>/app.db)
    #[arg(long, global = true, env = "SNAPKEEP_DATA_FILE")]
    data_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a manual snapshot now
    Create {
        /// User the snapshot is attributed to
        #[arg(short, long, env = "SNAPKEEP_ACTOR")]
        actor: String,
        /// Free-text description
        #[arg(short, long)]
        description: Option<String>,
        /// Exempt the snapshot from automatic retention
        #[arg(long)]
        retain: bool,
    },
    /// List all snapshots, newest first
    List,
    /// Show details of a specific snapshot
    Show {
        /// Snapshot identifier
        snapshot_id: String,
    },
    /// Replace the live data file with a snapshot
    Restore {
        /// Snapshot identifier
        snapshot_id: String,
        /// User performing the restore
        #[arg(short, long, env = "SNAPKEEP_ACTOR")]
        actor: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Mark a snapshot as exempt from retention (or clear the mark)
    Retain {
        /// Snapshot identifier
        snapshot_id: String,
        /// User changing the flag
        #[arg(short, long, env = "SNAPKEEP_ACTOR")]
        actor: String,
        /// Clear the flag instead of setting it
        #[arg(long)]
        off: bool,
    },
    /// Delete a snapshot and its file
    Delete {
        /// Snapshot identifier
        snapshot_id: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Apply the retention policy now
    Prune,
    /// Verify a snapshot file against its recorded hash
    Verify {
        /// Snapshot identifier
        snapshot_id: String,
    },
    /// Show schedule, configuration and disk usage
    Status,
    /// Inspect or change snapshot settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Run the daily scheduler in the foreground until Ctrl-C
    Run {
        /// Delay policy after a failed iteration: fixed:<secs> or exponential:<initial>:<max>
        #[arg(long, default_value = "fixed:300")]
        retry: RetryPolicy,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show stored and effective values
    Show,
    /// Validate and store a setting
    Set {
        key: String,
        value: String,
        /// User making the change
        #[arg(short, long, env = "SNAPKEEP_ACTOR")]
        actor: String,
    },
}

#[derive(Tabled)]
struct SnapshotInfo {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "By")]
    created_by: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Retained")]
    retained: String,
    #[tabled(rename = "Description")]
    description: String,
}

impl From<&Snapshot> for SnapshotInfo {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            kind: snapshot.kind.to_string(),
            created: format_timestamp(snapshot.created_at),
            created_by: snapshot.created_by.clone().unwrap_or_else(|| "system".into()),
            size: format_size(snapshot.size_bytes),
            retained: if snapshot.is_retained { "yes" } else { "" }.to_string(),
            description: snapshot.description.clone().unwrap_or_default(),
        }
    }
}

#[derive(Tabled)]
struct SettingInfo {
    #[tabled(rename = "Setting")]
    key: String,
    #[tabled(rename = "Stored")]
    stored: String,
    #[tabled(rename = "Effective")]
    effective: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs)?;

    let engine = build_engine(&cli);

    match cli.command {
        Commands::Create {
            actor,
            description,
            retain,
        } => create_snapshot(&engine, &actor, description.as_deref(), retain)?,
        Commands::List => list_snapshots(&engine)?,
        Commands::Show { snapshot_id } => show_snapshot(&engine, &snapshot_id)?,
        Commands::Restore {
            snapshot_id,
            actor,
            force,
        } => restore_snapshot(&engine, &snapshot_id, &actor, force)?,
        Commands::Retain {
            snapshot_id,
            actor,
            off,
        } => retain_snapshot(&engine, &snapshot_id, &actor, !off)?,
        Commands::Delete { snapshot_id, force } => delete_snapshot(&engine, &snapshot_id, force)?,
        Commands::Prune => prune_snapshots(&engine)?,
        Commands::Verify { snapshot_id } => verify_snapshot(&engine, &snapshot_id)?,
        Commands::Status => show_status(&engine)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => show_config(&engine, &cli.root),
            ConfigCommands::Set { key, value, actor } => {
                set_config(&engine, &key, &value, &actor)?
            }
        },
        Commands::Run { retry } => run_scheduler(engine, retry).await?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json_logs: bool) -> Result<(), anyhow::Error> {
    let format = if json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    let directive = if verbose {
        "debug"
    } else {
        "snapkeep=info,snapkeep_core=info"
    };
    init_observability(format, directive).context("failed to initialize logging")
}

fn build_engine(cli: &Cli) -> Engine {
    let data_file = cli
        .data_file
        .clone()
        .unwrap_or_else(|| cli.root.join(DEFAULT_DATA_FILE));

    SnapshotEngine::new(
        JsonFileRepository::new(cli.root.join(INDEX_FILE)),
        JsonFileSettings::new(cli.root.join(SETTINGS_FILE)),
        data_file,
        &cli.root,
    )
}

fn confirm(prompt: &str) -> Result<bool, anyhow::Error> {
    print!("{prompt} (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

fn create_snapshot(
    engine: &Engine,
    actor: &str,
    description: Option<&str>,
    retain: bool,
) -> Result<(), anyhow::Error> {
    let snapshot = engine.create(SnapshotKind::manual(), Some(actor), description, retain)?;

    println!("✓ Snapshot created");
    println!("  ID: {}", snapshot.id);
    println!("  File: {}", snapshot.file_path.display());
    println!("  Size: {}", format_size(snapshot.size_bytes));
    Ok(())
}

fn list_snapshots(engine: &Engine) -> Result<(), anyhow::Error> {
    let snapshots = engine.list()?;
    debug!(count = snapshots.len(), "Listing snapshots");

    if snapshots.is_empty() {
        println!("No snapshots found");
    } else {
        let rows: Vec<SnapshotInfo> = snapshots.iter().map(SnapshotInfo::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn show_snapshot(engine: &Engine, snapshot_id: &str) -> Result<(), anyhow::Error> {
    let snapshot = engine.get(snapshot_id)?;

    println!("Snapshot Details:");
    println!("  ID: {}", snapshot.id);
    println!("  Kind: {}", snapshot.kind);
    println!("  Created: {}", format_timestamp(snapshot.created_at));
    println!(
        "  Created By: {}",
        snapshot.created_by.as_deref().unwrap_or("system")
    );
    println!("  File: {}", snapshot.file_path.display());
    println!("  Size: {}", format_size(snapshot.size_bytes));
    println!("  Retained: {}", snapshot.is_retained);
    if !snapshot.content_hash.is_empty() {
        println!("  Content Hash: {}", snapshot.content_hash);
    }
    if let Some(description) = &snapshot.description {
        println!("  Description: {description}");
    }
    if !snapshot.file_path.exists() {
        println!("  ⚠ Snapshot file is missing");
    }
    Ok(())
}

fn restore_snapshot(
    engine: &Engine,
    snapshot_id: &str,
    actor: &str,
    force: bool,
) -> Result<(), anyhow::Error> {
    let snapshot = engine.get(snapshot_id)?;

    if !force {
        let prompt = format!(
            "Replace {} with snapshot '{}' from {}?",
            engine.data_file().display(),
            snapshot.id,
            format_timestamp(snapshot.created_at)
        );
        if !confirm(&prompt)? {
            println!("Restore cancelled");
            return Ok(());
        }
    }

    let backup = engine.restore(&snapshot)?;
    info!(snapshot_id = %snapshot.id, actor, "Restore requested from CLI");

    println!("✓ Snapshot restored");
    match backup {
        Some(path) => println!("  Previous data saved to: {}", path.display()),
        None => println!("  No previous data file existed"),
    }
    Ok(())
}

fn retain_snapshot(
    engine: &Engine,
    snapshot_id: &str,
    actor: &str,
    retained: bool,
) -> Result<(), anyhow::Error> {
    let snapshot = engine.set_retained(snapshot_id, retained, actor)?;
    if snapshot.is_retained {
        println!("✓ Snapshot {} will be kept by retention", snapshot.id);
    } else {
        println!("✓ Snapshot {} is subject to retention again", snapshot.id);
    }
    Ok(())
}

fn delete_snapshot(engine: &Engine, snapshot_id: &str, force: bool) -> Result<(), anyhow::Error> {
    if !force && !confirm(&format!("Are you sure you want to delete snapshot '{snapshot_id}'?"))? {
        println!("Deletion cancelled");
        return Ok(());
    }

    engine.delete(snapshot_id)?;
    println!("✓ Snapshot deleted successfully");
    Ok(())
}

fn prune_snapshots(engine: &Engine) -> Result<(), anyhow::Error> {
    let deleted = engine.enforce_retention()?;
    println!("✓ Retention removed {deleted} snapshot(s)");
    Ok(())
}

fn verify_snapshot(engine: &Engine, snapshot_id: &str) -> Result<(), anyhow::Error> {
    let snapshot = engine.get(snapshot_id)?;

    match engine.verify(&snapshot) {
        Ok(()) => {
            println!("✓ Snapshot is valid and integrity check passed");
            Ok(())
        }
        Err(SnapshotError::IntegrityCheckFailed { expected, actual }) => {
            error!("✗ Integrity check failed:");
            error!("  Expected hash: {}", expected);
            error!("  Actual hash: {}", actual);
            bail!("Integrity check failed")
        }
        Err(e) => {
            error!("✗ Failed to verify snapshot: {}", e);
            Err(e.into())
        }
    }
}

fn show_status(engine: &Engine) -> Result<(), anyhow::Error> {
    let now = Utc::now();
    let status = engine.schedule_status(now)?;
    let usage = engine.usage()?;
    let config = engine.config();

    println!("Schedule:");
    if status.enabled {
        println!("  Automated snapshots: enabled");
        println!("  Next run: {}", format_timestamp(status.next_run));
        if status.overdue {
            println!("  ⚠ Today's snapshot is due and has not been taken yet");
        }
    } else {
        println!("  Automated snapshots: disabled");
    }

    println!("Retention:");
    println!("  Keep for: {} day(s)", config.retention_days);
    println!("  Keep at most: {} automated snapshot(s)", config.max_snapshots);

    println!("Storage:");
    println!("  Data file: {}", engine.data_file().display());
    println!("  Snapshot directory: {}", engine.snapshot_dir().display());
    println!(
        "  Snapshots: {} ({})",
        usage.count,
        format_size(usage.total_bytes)
    );
    Ok(())
}

fn effective_value(current: &SnapshotConfig, key: &str, root: &Path) -> String {
    match key {
        config::KEY_AUTO_ENABLED => current.auto_enabled.to_string(),
        config::KEY_DAILY_TIME => current.daily_time.format("%H:%M").to_string(),
        config::KEY_RETENTION_DAYS => current.retention_days.to_string(),
        config::KEY_MAX_SNAPSHOTS => current.max_snapshots.to_string(),
        config::KEY_SNAPSHOT_DIR => current.resolve_snapshot_dir(root).display().to_string(),
        _ => String::new(),
    }
}

fn show_config(engine: &Engine, root: &Path) {
    let current = engine.config();
    let rows: Vec<SettingInfo> = KNOWN_KEYS
        .iter()
        .map(|key| SettingInfo {
            key: key.to_string(),
            stored: engine
                .settings()
                .get(key)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "(default)".into()),
            effective: effective_value(&current, key, root),
        })
        .collect();
    println!("{}", Table::new(rows));
}

fn set_config(engine: &Engine, key: &str, raw: &str, actor: &str) -> Result<(), anyhow::Error> {
    let value = SnapshotConfig::validate_key(key, raw)?;
    engine.settings().set(key, value.clone(), Some(actor))?;
    println!("✓ {key} = {value}");
    Ok(())
}

async fn run_scheduler(engine: Engine, retry: RetryPolicy) -> Result<(), anyhow::Error> {
    let options = SchedulerOptions {
        retry_policy: retry,
        ..SchedulerOptions::default()
    };
    let scheduler = Arc::new(Scheduler::new(Arc::new(engine), options));

    scheduler.start()?;
    let next = scheduler.engine().next_scheduled_run(Utc::now())?;
    if next.enabled {
        println!("Scheduler running; next snapshot due {}", format_timestamp(next.at));
    } else {
        println!("Scheduler running; automated snapshots are currently disabled");
    }
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let stopper = Arc::clone(&scheduler);
    let stopped = tokio::task::spawn_blocking(move || stopper.stop()).await?;
    if !stopped {
        bail!("scheduler did not stop in time");
    }

    if let Some(metrics) = snapkeep_core::SnapkeepMetrics::global() {
        match metrics.gather_metrics() {
            Ok(text) => debug!(metrics = %text, "Final snapshot metrics"),
            Err(e) => debug!(error = %e, "Could not gather metrics"),
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
