mod config;

use crate::config::{DaemonConfig, SourceConfig};
use backup_engine::utils::logger;
use backup_engine::{BackupEngine, DirectoryProvider, EngineScheduler, RestoreSummary};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "backup-daemon", version, about = "Scheduled backups with deduplication and replication")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "/etc/server-backup/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until SIGINT/SIGTERM
    Run,
    /// Take a backup now
    Backup {
        /// Incremental against the latest backup instead of a full one
        #[arg(long)]
        incremental: bool,
        #[arg(short, long, default_value = "Manual backup")]
        description: String,
    },
    /// Restore a backup chain, or the closest backup to a point in time
    Restore {
        #[arg(required_unless_present = "at", conflicts_with = "at")]
        backup_id: Option<String>,
        /// RFC 3339 instant
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// Restore only these providers
        #[arg(long = "only", requires = "backup_id")]
        only: Vec<String>,
    },
    /// List backups, oldest first
    List,
    /// Validate one backup, or all of them
    Validate { backup_id: Option<String> },
    /// Apply the retention policy
    Cleanup,
    /// Replicate every backup not yet on the target
    Replicate,
    /// Pull a backup back from the replication target
    Import { backup_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = DaemonConfig::load(&cli.config)?;
    logger::init_from_config(&config.engine.log)?;
    if !cli.config.exists() {
        tracing::warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    let engine = Arc::new(BackupEngine::open(config.engine.clone())?);
    for source in &config.sources {
        register_source(&engine, source);
    }

    match cli.command {
        Command::Run => run(engine).await,
        command => {
            tokio::task::spawn_blocking(move || one_shot(&engine, command)).await??;
            Ok(())
        }
    }
}

fn register_source(engine: &BackupEngine, source: &SourceConfig) {
    let mut provider = DirectoryProvider::new(&source.id, &source.path)
        .chunked(source.chunked)
        .exclude(source.exclude.iter().cloned());
    if let Some(name) = &source.display_name {
        provider = provider.with_display_name(name);
    }
    tracing::info!(
        provider = %source.id,
        path = %source.path.display(),
        chunked = source.chunked,
        "Registered directory source"
    );
    engine.register_provider(Arc::new(provider));
}

async fn run(engine: Arc<BackupEngine>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let scheduler = EngineScheduler::new(engine.clone()).await?;
    scheduler.init_schedules().await?;
    scheduler.start().await?;
    tracing::info!(root = %engine.backup_root().display(), "Backup daemon running");

    shutdown_signal(cancel.clone()).await;

    tracing::info!("Shutting down...");
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    tracing::info!("Daemon stopped");
    Ok(())
}

fn one_shot(engine: &BackupEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run => anyhow::bail!("run is not a one-shot command"),
        Command::Backup {
            incremental,
            description,
        } => {
            let record = if incremental {
                engine.create_incremental_backup(&description)?
            } else {
                engine.create_full_backup(&description)?
            };
            println!(
                "{} {} files={} valid={}",
                record.id,
                record.backup_type,
                record.file_count(),
                record.valid
            );
        }
        Command::Restore { backup_id, at, only } => {
            let summary = match (backup_id, at) {
                (Some(id), _) if !only.is_empty() => engine.restore_components(&id, &only)?,
                (Some(id), _) => engine.restore_backup(&id)?,
                (None, Some(at)) => engine.restore_to_point_in_time(at)?,
                (None, None) => anyhow::bail!("a backup id or --at is required"),
            };
            print_restore(&summary);
        }
        Command::List => {
            for record in engine.list_backups() {
                println!(
                    "{}  {:<11}  {}  parent={}  valid={}  replicated={}  {}",
                    record.id,
                    record.backup_type.to_string(),
                    record.timestamp.to_rfc3339(),
                    record.parent_id.as_deref().unwrap_or("-"),
                    record.valid,
                    record.replicated,
                    record.description
                );
            }
        }
        Command::Validate { backup_id: Some(id) } => {
            let record = engine.validate_backup(&id)?;
            println!(
                "{} valid={} {}",
                record.id,
                record.valid,
                record.validation_message.unwrap_or_default()
            );
        }
        Command::Validate { backup_id: None } => {
            let outcomes = engine.validate_backups()?;
            let invalid = outcomes.iter().filter(|o| !o.valid).count();
            for outcome in &outcomes {
                println!("{} valid={} {}", outcome.backup_id, outcome.valid, outcome.message);
            }
            println!("{} checked, {} invalid", outcomes.len(), invalid);
        }
        Command::Cleanup => {
            let removed = engine.cleanup_old_backups()?;
            println!("removed {} backup(s)", removed.len());
            for id in removed {
                println!("  {id}");
            }
        }
        Command::Replicate => {
            let count = engine.replicate_pending()?;
            println!("replicated {count} backup(s)");
        }
        Command::Import { backup_id } => {
            let record = engine.import_backup(&backup_id)?;
            println!("imported {} ({})", record.id, record.backup_type);
        }
    }
    Ok(())
}

fn print_restore(summary: &RestoreSummary) {
    println!("restored {} via {}", summary.target, summary.chain.join(" -> "));
    println!("providers: {}", summary.providers_restored.join(", "));
    if summary.truncated {
        println!("warning: chain did not reach a full backup");
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
