#[macro_use]
mod logging;

pub mod admission;
pub mod error;
pub mod identity;
pub mod io;
pub mod schema;
pub mod sessions;
pub mod settings;
pub mod store;

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use crate::error::IngestError;
use crate::io::hotplug::{HotplugIntent, HotplugWatcher};
use crate::io::serial::link::SerialOpener;
use crate::schema::Schema;
use crate::sessions::{SessionDeps, SessionManager};
use crate::settings::{Overrides, Settings};
use crate::store::{PersistenceSink, SqliteSink};

// ============================================================================
// Command line
// ============================================================================

#[derive(Parser)]
#[command(name = "onionlog", author, version, about)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Watch for sensor boxes and record their frames (default)
    Run(RunArgs),
    /// List serial ports with their USB ids
    Ports,
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Settings file (default: <config dir>/onionlog/settings.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Newline-delimited column names
    #[arg(long)]
    schema: Option<PathBuf>,
    /// SQLite database file
    #[arg(long)]
    database: Option<PathBuf>,
    /// Directory device nodes appear in
    #[arg(long)]
    dev_dir: Option<PathBuf>,
    /// Also write the log to a timestamped file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Record every known device without asking
    #[arg(long, short = 'y')]
    yes: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            schema_path: self.schema.clone(),
            database_path: self.database.clone(),
            dev_dir: self.dev_dir.clone(),
            log_dir: self.log_dir.clone(),
            accept_all: self.yes,
        }
    }
}

/// Entry point for the `onionlog` binary
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Ports) => list_ports(),
        Some(Command::Run(args)) => run_ingest_command(&args),
        None => run_ingest_command(&cli.run),
    }
}

fn list_ports() -> ExitCode {
    match io::serial::list_serial_ports() {
        Ok(ports) if ports.is_empty() => {
            println!("No serial ports found");
            ExitCode::SUCCESS
        }
        Ok(ports) => {
            for port in ports {
                println!("{}", port.describe());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tlog!("[ports] {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_ingest_command(args: &RunArgs) -> ExitCode {
    let mut settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[setup] {}", e);
            return ExitCode::FAILURE;
        }
    };
    settings.apply_overrides(&args.overrides());

    if let Some(dir) = &settings.log_dir {
        if let Err(e) = logging::init_file_logging(dir) {
            tlog!("[setup] {}; logging to stderr only", e);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tlog!("[setup] Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(ingest(settings));
    // An unanswered admission prompt must not hold the process open
    runtime.shutdown_timeout(Duration::from_secs(2));

    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tlog!("[ingest] Fatal: {}", e);
            ExitCode::FAILURE
        }
    };
    logging::stop_file_logging();
    code
}

// ============================================================================
// Ingestion
// ============================================================================

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tlog!("[ingest] SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tlog!("[ingest] Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Full ingestion run with real serial ports and the SQLite store,
/// until a shutdown signal arrives.
pub async fn ingest(settings: Settings) -> Result<(), IngestError> {
    settings.validate()?;

    let schema = Schema::load(&settings.schema_path)?;
    tlog!(
        "[ingest] Schema {} has {} columns",
        settings.schema_path.display(),
        schema.len()
    );

    let sink = Arc::new(SqliteSink::open(&settings.database_path, &settings.table)?);
    sink.ensure_schema(schema.columns())?;

    let deps = SessionDeps {
        admission: admission::from_settings(&settings.admission),
        opener: Arc::new(SerialOpener::new(settings.link_config())),
        sink: sink.clone(),
        schema,
        framing: settings.framing_config()?,
        timing: settings.session_timing(),
    };

    run_ingest(&settings, deps, shutdown_signal()).await?;

    match sink.count_records(None) {
        Ok(total) => tlog!("[ingest] {} records in {}", total, settings.table),
        Err(e) => tlog!("[ingest] Could not count records: {}", e),
    }
    Ok(())
}

/// Watch for devices and drive sessions until `shutdown` resolves or the
/// watcher fails. Every session is stopped and joined before returning.
pub async fn run_ingest<F>(settings: &Settings, deps: SessionDeps, shutdown: F) -> Result<(), IngestError>
where
    F: Future<Output = ()>,
{
    let identities = settings.identities()?;
    let names: Vec<&str> = identities.iter().map(|(id, _)| id.name()).collect();
    tlog!("[ingest] Recognised devices: {}", names.join(", "));

    let (intent_tx, mut intents) = mpsc::channel(64);
    let mut watcher = HotplugWatcher::start(&settings.hotplug, identities.clone(), intent_tx)?;
    let (manager, mut exits) = SessionManager::new(deps);

    tokio::pin!(shutdown);

    let result: Result<(), IngestError> = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tlog!("[ingest] Shutdown requested");
                break Ok(());
            }
            finished = watcher.finished() => {
                break finished.map_err(IngestError::from);
            }
            Some(exit) = exits.recv() => {
                manager.on_session_exit(exit).await;
            }
            Some(intent) = intents.recv() => match intent {
                // Admission may wait on a person; stay responsive to shutdown
                HotplugIntent::Arrived { identity, path } => {
                    tokio::select! {
                        _ = manager.on_arrived(identity, path) => {}
                        _ = &mut shutdown => {
                            tlog!("[ingest] Shutdown requested");
                            break Ok(());
                        }
                    }
                }
                // Bounded by one read timeout
                HotplugIntent::Departed { identity, path } => {
                    manager.on_departed(&identity, &path).await;
                }
            },
        }
    };

    // A watcher blocked on a full channel only notices once the receiver is gone
    drop(intents);
    watcher.stop().await;
    manager.shutdown().await;
    result
}
