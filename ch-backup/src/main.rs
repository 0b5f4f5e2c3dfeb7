//! ch-backup - Main entry point
//!
//! Every command prints a JSON report on stdout; logs go to stderr or the
//! configured log file.

use anyhow::{Context, Result};
use ch_backup::database::TableRef;
use ch_backup::orchestrator::{CreateOptions, RestoreOptions};
use ch_backup::utils::shutdown::ShutdownCoordinator;
use ch_backup::{utils, BackupError, Config, Orchestrator};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a new backup of the configured scope
    Create {
        /// Reuse unchanged parts of the newest backup
        #[arg(long)]
        incremental: bool,

        /// Store every part in full even if incremental is configured
        #[arg(long, conflicts_with = "incremental")]
        full: bool,

        /// Ignore backup.min_interval
        #[arg(long)]
        force: bool,

        /// Label attached to the backup (repeatable)
        #[arg(long = "label", value_name = "KEY=VALUE", value_parser = parse_label)]
        labels: Vec<(String, String)>,

        /// Only back up these tables (db.table, comma separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Also store users, roles, quotas, row policies and settings profiles
        #[arg(long)]
        backup_access_control: bool,
    },

    /// Restore a finished backup
    Restore {
        backup_id: String,

        /// Only restore these tables (db.table, comma separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Do not restore access entities stored in the backup
        #[arg(long)]
        skip_access_control: bool,
    },

    /// List backups, oldest first
    List,

    /// Print a backup manifest
    Show { backup_id: String },

    /// Delete a backup and release its content
    Delete {
        backup_id: String,

        /// Delete even if other backups use it as incremental basis
        #[arg(long)]
        force: bool,
    },

    /// Apply the retention policy, then garbage-collect
    Purge {
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Garbage-collect unreferenced content
    Sweep,

    /// Forcibly release the scope lock
    BreakLock,
}

fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("label must look like key=value: '{s}'")),
    }
}

fn parse_tables(tables: &[String]) -> ch_backup::Result<Vec<TableRef>> {
    tables.iter().map(|t| TableRef::parse(t)).collect()
}

/// Exit status per failure class, so wrappers can tell "try later" apart
/// from "broken".
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<BackupError>() {
        Some(BackupError::LockBusy { .. }) => 75,
        Some(BackupError::Cancelled(_)) => 130,
        Some(BackupError::Config(_)) => 78,
        Some(BackupError::BackupNotFound(_)) | Some(BackupError::PolicyViolation(_)) => 2,
        _ => 1,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log)?;

    if config.main.drop_privileges {
        utils::privileges::drop_privileges(&config.main.user, &config.main.group)?;
    }

    tracing::debug!(
        "Starting ch-backup v{} (scope: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.scope
    );

    let shutdown = ShutdownCoordinator::new();
    let _listener = shutdown.spawn_listener();
    let cancel = shutdown.token();

    let orchestrator = Orchestrator::from_config(config)?;

    match args.command {
        Command::Create {
            incremental,
            full,
            force,
            labels,
            tables,
            backup_access_control,
        } => {
            let options = CreateOptions {
                incremental: match (incremental, full) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                force,
                labels: labels.into_iter().collect::<BTreeMap<_, _>>(),
                tables: parse_tables(&tables)?,
                access_control: backup_access_control,
            };
            print_json(&orchestrator.create(options, &cancel).await?)
        }
        Command::Restore {
            backup_id,
            tables,
            skip_access_control,
        } => {
            let options = RestoreOptions {
                tables: parse_tables(&tables)?,
                skip_access_control,
            };
            print_json(&orchestrator.restore(&backup_id, options, &cancel).await?)
        }
        Command::List => print_json(&orchestrator.list().await?),
        Command::Show { backup_id } => print_json(&orchestrator.show(&backup_id).await?),
        Command::Delete { backup_id, force } => {
            print_json(&orchestrator.delete(&backup_id, force, &cancel).await?)
        }
        Command::Purge { dry_run } => print_json(&orchestrator.purge(dry_run, &cancel).await?),
        Command::Sweep => print_json(&orchestrator.sweep(&cancel).await?),
        Command::BreakLock => print_json(&orchestrator.break_lock().await?),
    }
}
