//! idmap-migrate CLI - run, inspect, and roll back id-mapped migrations.

use clap::{Parser, Subcommand};
use idmap_migrate::{
    Config, IdMap, IdValue, MessageLevel, MigrateError, MigrationCatalog, RunOptions, RunStatus,
    RunSummary, StatusReport, TracingSink,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code of a run that stopped before the source was exhausted.
const EXIT_INCOMPLETE: u8 = 3;
const EXIT_STOPPED: u8 = 130;

#[derive(Parser)]
#[command(name = "idmap-migrate")]
#[command(about = "Record migrations with a persistent source to destination id map")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "migrate.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import rows of a migration
    Import {
        /// Migration id
        migration: String,

        /// Re-import rows that were already imported
        #[arg(long)]
        update: bool,

        /// Stop after this many processed rows
        #[arg(long)]
        limit: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        time_limit: Option<u64>,

        /// Only these source keys: "1,2,3", or "1:en,2:fr" for composite keys
        #[arg(long, value_parser = parse_id_list)]
        idlist: Option<IdList>,

        /// Log progress every N processed rows
        #[arg(long)]
        feedback: Option<u64>,
    },

    /// Remove everything a migration imported
    Rollback {
        /// Migration id
        migration: String,
    },

    /// Show progress of one or all migrations
    Status {
        /// Migration id (default: all)
        migration: Option<String>,
    },

    /// List messages recorded by a migration
    Messages {
        /// Migration id
        migration: String,

        /// Only messages of this level: error, warning, notice, informational
        #[arg(long)]
        level: Option<String>,
    },

    /// Delete all messages of a migration
    ClearMessages {
        /// Migration id
        migration: String,
    },

    /// Drop the id map and message tables of a migration
    Destroy {
        /// Migration id
        migration: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    let catalog = MigrationCatalog::new(config);

    match cli.command {
        Commands::Import {
            migration,
            update,
            limit,
            time_limit,
            idlist,
            feedback,
        } => {
            let options = RunOptions {
                limit,
                time_limit: time_limit.map(Duration::from_secs),
                id_list: idlist.map(|list| list.0),
                update,
                feedback_every: feedback,
            };
            let stop = Arc::new(AtomicBool::new(false));
            let cancel_token = setup_signal_handler().await?;
            watch_cancellation(cancel_token, stop.clone());

            let mut exec = catalog
                .executable(&migration, Arc::new(TracingSink), options)?
                .with_stop_flag(stop);
            let summary = tokio::task::spawn_blocking(move || exec.import())
                .await
                .map_err(|e| MigrateError::unexpected(e.to_string()))??;

            print_summary(&summary, cli.output_json)?;
            Ok(exit_status(summary.status))
        }

        Commands::Rollback { migration } => {
            let stop = Arc::new(AtomicBool::new(false));
            let cancel_token = setup_signal_handler().await?;
            watch_cancellation(cancel_token, stop.clone());

            let mut exec = catalog
                .executable(&migration, Arc::new(TracingSink), RunOptions::default())?
                .with_stop_flag(stop);
            let summary = tokio::task::spawn_blocking(move || exec.rollback())
                .await
                .map_err(|e| MigrateError::unexpected(e.to_string()))??;

            print_summary(&summary, cli.output_json)?;
            Ok(exit_status(summary.status))
        }

        Commands::Status { migration } => {
            let ids: Vec<String> = match migration {
                Some(id) => vec![id],
                None => catalog.ids().into_iter().map(String::from).collect(),
            };

            let mut reports = Vec::with_capacity(ids.len());
            for id in &ids {
                let migration = catalog.migration(id)?;
                let id_map = catalog.id_map(id)?;
                reports.push(StatusReport::collect(&migration, &id_map)?);
            }

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_status(&reports);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Messages { migration, level } => {
            let level = level.as_deref().map(parse_level).transpose()?;
            let id_map = catalog.id_map(&migration)?;
            let messages = id_map.messages(None, level)?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else if messages.is_empty() {
                println!("No messages for {}", migration);
            } else {
                for m in &messages {
                    println!(
                        "{:<16} {:<14} {}",
                        idmap_migrate::format_ids(&m.source_ids),
                        m.level.as_str(),
                        m.message
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::ClearMessages { migration } => {
            let id_map = catalog.id_map(&migration)?;
            let count = id_map.message_count()?;
            id_map.clear_messages()?;
            println!("Cleared {} messages for {}", count, migration);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Destroy { migration } => {
            let id_map = catalog.id_map(&migration)?;
            id_map.destroy()?;
            println!("Destroyed id map of {}", migration);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_status(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Incomplete => ExitCode::from(EXIT_INCOMPLETE),
        RunStatus::Stopped => ExitCode::from(EXIT_STOPPED),
        RunStatus::Failed => ExitCode::FAILURE,
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", summary.to_json()?);
        return Ok(());
    }

    let c = &summary.counts;
    println!(
        "\n{} {}: {}",
        summary.operation,
        summary.migration_id,
        summary.status.as_str()
    );
    println!("  Run ID: {}", summary.run_id);
    println!("  Duration: {:.2}s", summary.duration_secs);
    println!("  Processed: {}", c.processed);
    if summary.operation == "rollback" {
        println!("  Rolled back: {}", c.rolled_back);
    } else {
        println!("  Created: {}", c.created);
        println!("  Updated: {}", c.updated);
        println!("  Ignored: {}", c.ignored);
        println!("  Skipped: {}", c.skipped);
        println!("  Unchanged: {}", c.unchanged);
    }
    println!("  Failed: {}", c.failed);
    Ok(())
}

fn print_status(reports: &[StatusReport]) {
    println!(
        "{:<24} {:>8} {:>10} {:>9} {:>7} {:>7} {:>9}",
        "Migration", "Total", "Processed", "Imported", "Update", "Errors", "Messages"
    );
    for r in reports {
        let total = r.total.map(|t| t.to_string()).unwrap_or_else(|| "N/A".into());
        println!(
            "{:<24} {:>8} {:>10} {:>9} {:>7} {:>7} {:>9}",
            r.migration_id, total, r.processed, r.imported, r.needs_update, r.errors, r.messages
        );
    }
}

fn parse_level(level: &str) -> Result<MessageLevel, MigrateError> {
    match level.to_lowercase().as_str() {
        "error" => Ok(MessageLevel::Error),
        "warning" => Ok(MessageLevel::Warning),
        "notice" => Ok(MessageLevel::Notice),
        "informational" | "info" => Ok(MessageLevel::Informational),
        other => Err(MigrateError::Config(format!("Unknown message level: {}", other))),
    }
}

/// Source keys given on the command line.
#[derive(Debug, Clone)]
struct IdList(Vec<Vec<IdValue>>);

/// Parse `1,2,3` or `1:en,2:fr` into source keys.
fn parse_id_list(raw: &str) -> Result<IdList, String> {
    let keys: Vec<Vec<IdValue>> = raw
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| {
            key.split(':')
                .map(|part| match part.trim().parse::<i64>() {
                    Ok(i) => IdValue::Integer(i),
                    Err(_) => IdValue::String(part.trim().to_string()),
                })
                .collect()
        })
        .collect();
    if keys.is_empty() {
        return Err("id list is empty".to_string());
    }
    Ok(IdList(keys))
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Raise the run's stop flag once the token is cancelled. The run checks it
/// between rows.
fn watch_cancellation(token: CancellationToken, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        token.cancelled().await;
        stop.store(true, Ordering::SeqCst);
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping after the current row...");
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping after the current row...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current row...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
