//! gpuq daemon
//!
//! Runs the scheduler loop for one task database, and stops or restarts a
//! running instance.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gpuq_core::{detect_prober, DaemonConfig, DeviceProber, LoggingConfig};
use gpuq_runtime::{Launcher, ProcessLauncher};
use gpuq_scheduler::{
    GpuManager, Scheduler, SchedulerOptions, ServerRegistry, StopOutcome, StopSignal,
};
use gpuq_store::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// gpuq daemon - single-node GPU task scheduler
#[derive(Parser, Debug)]
#[command(name = "gpuqd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Task database, overrides `[store] database`
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log level or filter, overrides `[logging] level`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Start the scheduler in the foreground
    Start,
    /// Stop the running scheduler
    Stop,
    /// Stop the running scheduler, then start a new one
    Restart,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(database) = args.database {
        config.store.database = database;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.scheduler.validate()?;

    let _guard = init_logging(&config.logging)?;

    let store = SqliteStore::connect(&config.store.database)
        .await
        .with_context(|| format!("failed to open {}", config.store.database.display()))?;
    let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher::default());
    let registry = ServerRegistry::new(
        store.clone(),
        launcher.clone(),
        config.scheduler.stop_retry(),
    );

    match args.command {
        Command::Start => start(&config, store, launcher, &registry).await,
        Command::Stop => stop(&registry).await,
        Command::Restart => {
            stop(&registry).await?;
            start(&config, store, launcher, &registry).await
        }
    }
}

async fn start(
    config: &DaemonConfig,
    store: SqliteStore,
    launcher: Arc<dyn Launcher>,
    registry: &ServerRegistry,
) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.store.database.display(),
        "Starting gpuq daemon"
    );

    let prober: Arc<dyn DeviceProber> = Arc::from(detect_prober());
    let gpus = GpuManager::new(
        prober,
        config.scheduler.max_load,
        config.scheduler.max_memory,
    )?;

    let server = registry.start(std::process::id()).await?;

    let stop = StopSignal::new();
    let listener = stop.listen_for_signals();

    let scheduler = Scheduler::new(
        store,
        gpus,
        launcher,
        SchedulerOptions::from(&config.scheduler),
        stop.clone(),
    );
    let result = scheduler.run(&server).await;

    listener.abort();
    result?;
    Ok(())
}

async fn stop(registry: &ServerRegistry) -> anyhow::Result<()> {
    println!("stopping server...");
    match registry.stop().await? {
        StopOutcome::Idle => println!("no server is running"),
        StopOutcome::Stopped { pid } => println!("server with pid {} stopped", pid),
    }
    Ok(())
}

/// Install the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    // Build the filter, warning if the configured value is not a valid
    // filter expression.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match config.level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: log level '{}' is not a valid tracing filter ({}); falling back to 'info'",
                    config.level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let json = config.format.eq_ignore_ascii_case("json");

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (dir, name) = split_log_path(path);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with((!json).then(|| fmt::layer().with_target(false)))
        .with(json.then(|| fmt::layer().json()))
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Directory and file name of a log path; a bare name lands in the working directory
fn split_log_path(path: &Path) -> (PathBuf, PathBuf) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gpuq.log"));
    (dir, name)
}
