//! Command-line surface.
//!
//! Argument structures are clap derives; [`run`] wires the components from
//! [`Settings`] and executes one command.

use clap::{ArgGroup, Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::{ArtifactCatalog, BackupProducer, Listing, UploadOutcome};
use crate::config::Settings;
use crate::database;
use crate::restore::{RestoreOptions, RestoreOrchestrator, RestoreSource};
use crate::retention::RetentionSweeper;
use crate::scheduler::{BackupJob, JobSchedule, RetentionJob, Scheduler};
use crate::storage::ObjectStoreClient;
use crate::Result;

/// Backup, retention and restore for the operational database
#[derive(Debug, Parser)]
#[command(name = "backup-warden", version, about, long_about = None)]
pub struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a backup now
    RunBackup {
        /// Show what would be created without touching anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply the retention policy to local and remote artifacts
    RunRetention {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore an artifact into the configured database
    Restore(RestoreArgs),
    /// List local and remote artifacts, newest first
    ListBackups,
    /// Run the backup and retention jobs on their schedules until Ctrl-C
    Schedule,
}

/// Exactly one restore source is required
#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["path", "latest", "from_remote"])))]
pub struct RestoreArgs {
    /// Local artifact file
    pub path: Option<PathBuf>,

    /// Newest artifact across local and remote storage
    #[arg(long)]
    pub latest: bool,

    /// Object key under backups/{kind}/
    #[arg(long, value_name = "KEY")]
    pub from_remote: Option<String>,

    /// Do not take a safety backup of the current state first
    #[arg(long)]
    pub skip_safety: bool,
}

impl RestoreArgs {
    fn source(&self) -> RestoreSource {
        match (&self.path, &self.from_remote) {
            (Some(path), _) => RestoreSource::Path(path.clone()),
            (None, Some(key)) => RestoreSource::Remote(key.clone()),
            (None, None) => RestoreSource::Latest,
        }
    }
}

/// Whether the command achieved everything it set out to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Exit code 0
    Success,
    /// Exit code 1
    Failure,
}

impl CommandStatus {
    /// Process exit code for this status
    pub fn exit_code(self) -> ExitCode {
        match self {
            CommandStatus::Success => ExitCode::SUCCESS,
            CommandStatus::Failure => ExitCode::FAILURE,
        }
    }

    fn from_ok(ok: bool) -> Self {
        if ok {
            CommandStatus::Success
        } else {
            CommandStatus::Failure
        }
    }
}

/// Shared building blocks for every command
struct Components {
    producer: BackupProducer,
    catalog: ArtifactCatalog,
    db: Arc<dyn database::Database>,
}

impl Components {
    async fn build(settings: &Settings) -> Result<Self> {
        let db = database::connect(&settings.database)?;
        let store = ObjectStoreClient::from_settings(&settings.object_store).await?;
        let producer = BackupProducer::new(db.clone(), store.clone(), settings.backup_dir.clone())
            .with_upload(settings.upload_enabled);
        let catalog = ArtifactCatalog::new(settings.backup_dir.clone(), store);
        Ok(Self { producer, catalog, db })
    }
}

/// Execute `cli.command`
pub async fn run(cli: Cli, settings: Settings) -> Result<CommandStatus> {
    let components = Components::build(&settings).await?;
    let json = cli.json;

    match cli.command {
        Command::RunBackup { dry_run: true } => {
            let plan = components.producer.plan();
            emit(json, &plan, || {
                format!(
                    "Would create {} ({}) in {}{}",
                    plan.name,
                    plan.kind,
                    plan.directory.display(),
                    plan.remote_key
                        .as_ref()
                        .map(|key| format!(" and upload to {}", key))
                        .unwrap_or_else(|| " (local only)".to_string())
                )
            })?;
            Ok(CommandStatus::Success)
        }
        Command::RunBackup { dry_run: false } => {
            let report = components.producer.produce().await?;
            emit(json, &report, || {
                let upload = match &report.upload {
                    UploadOutcome::Uploaded(key) => format!("uploaded to {}", key),
                    UploadOutcome::Skipped(reason) => format!("upload skipped: {}", reason),
                    UploadOutcome::Failed(reason) => format!("UPLOAD FAILED: {}", reason),
                };
                format!(
                    "Created {} ({} bytes, {}); {}",
                    report.artifact.location, report.artifact.size_bytes, report.manifest.dump_method, upload
                )
            })?;
            Ok(CommandStatus::from_ok(!report.upload.is_failure()))
        }
        Command::RunRetention { dry_run } => {
            let sweeper = RetentionSweeper::new(components.catalog, settings.retention);
            let report = sweeper.sweep(dry_run).await?;
            emit(json, &report, || {
                let verb = if report.dry_run { "Would delete" } else { "Deleted" };
                let mut lines: Vec<String> = report.deleted.iter().map(|l| format!("{} {}", verb, l)).collect();
                lines.extend(report.failed.iter().map(|l| format!("FAILED to delete {}", l)));
                if let Some(e) = &report.remote_error {
                    lines.push(format!("Remote listing failed: {}", e));
                }
                lines.push(format!(
                    "Kept {}, {} {}, {} unclassified left alone{}",
                    report.kept,
                    verb.to_lowercase(),
                    report.deleted.len(),
                    report.unclassified,
                    if report.remote_skipped { ", remote not configured" } else { "" }
                ));
                lines.join("\n")
            })?;
            Ok(CommandStatus::from_ok(report.is_clean()))
        }
        Command::Restore(args) => {
            let orchestrator = RestoreOrchestrator::new(components.db, components.producer, components.catalog);
            let options = RestoreOptions {
                skip_safety: args.skip_safety,
            };
            let report = orchestrator.restore(args.source(), options).await?;
            emit(json, &report, || {
                let mut lines = vec![format!("Restored {} from {}", report.artifact.name, report.artifact.location)];
                if let Some(safety) = &report.safety_backup {
                    lines.push(format!("Safety backup: {}", safety.location));
                }
                for aside in &report.summary.moved_aside {
                    lines.push(format!("Previous file kept at {}", aside.display()));
                }
                if report.summary.statements_applied + report.summary.statements_failed > 0 {
                    lines.push(format!(
                        "Statements: {} applied, {} already present, {} failed",
                        report.summary.statements_applied,
                        report.summary.duplicates_ignored,
                        report.summary.statements_failed
                    ));
                }
                lines.join("\n")
            })?;
            Ok(CommandStatus::from_ok(report.summary.statements_failed == 0))
        }
        Command::ListBackups => {
            let listing = components.catalog.list_all().await?;
            emit(json, &listing, || render_listing(&listing))?;
            Ok(CommandStatus::Success)
        }
        Command::Schedule => {
            let mut scheduler = Scheduler::new();
            let timezone = &settings.scheduler.timezone;
            scheduler.register(
                Arc::new(BackupJob::new(components.producer)),
                JobSchedule::new(&settings.scheduler.backup_schedule, timezone)?,
            )?;
            scheduler.register(
                Arc::new(RetentionJob::new(RetentionSweeper::new(components.catalog, settings.retention))),
                JobSchedule::new(&settings.scheduler.retention_schedule, timezone)?,
            )?;

            scheduler.start();
            info!("Scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await;

            for name in scheduler.job_names() {
                if let Some(stats) = scheduler.stats(&name) {
                    info!(job = %name, started = stats.started, completed = stats.completed,
                        failed = stats.failed, skipped = stats.skipped, "Job totals");
                }
            }
            Ok(CommandStatus::Success)
        }
    }
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn render_listing(listing: &Listing) -> String {
    let mut lines = Vec::new();
    if listing.artifacts.is_empty() {
        lines.push("No backups found".to_string());
    }
    for artifact in &listing.artifacts {
        lines.push(format!(
            "{}  {:<6}  {:<8}  {:>12}  {}{}",
            artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
            artifact.tier,
            artifact.kind,
            artifact.size_bytes,
            artifact.location,
            if artifact.safety { "  [safety]" } else { "" }
        ));
    }
    if !listing.unclassified.is_empty() {
        warn!(count = listing.unclassified.len(), "Entries with unrecognised names");
        lines.push(String::new());
        lines.push("Unclassified (ignored by retention and --latest):".to_string());
        for entry in &listing.unclassified {
            lines.push(format!("  {:<6}  {:>12}  {}", entry.tier, entry.size_bytes, entry.location));
        }
    }
    lines.join("\n")
}
