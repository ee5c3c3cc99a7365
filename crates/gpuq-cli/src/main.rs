//! gpuq CLI
//!
//! Command-line interface for submitting and managing tasks. Talks to the
//! task database directly; the daemon picks up changes on its next cycle.

mod commands;

use clap::{Parser, Subcommand};
use gpuq_core::{DaemonConfig, DeviceId, TaskId, TaskState, DEFAULT_PRIORITY};
use gpuq_store::SqliteStore;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpuq - queue commands for the GPUs of this host
#[derive(Parser, Debug)]
#[command(name = "gpuq")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the daemon's TOML config file, used to locate the database
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Task database, overrides the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a command, or every command in a task file
    Submit {
        /// Number of GPUs the task needs
        #[arg(short = 'n', long, default_value_t = 1)]
        num_gpus: u32,

        /// Devices the task must not use, e.g. `-e 0,3`
        #[arg(short = 'e', long, value_delimiter = ',')]
        exclude_gpus: Vec<DeviceId>,

        /// Smaller values run first
        #[arg(short, long, default_value_t = DEFAULT_PRIORITY, value_parser = clap::value_parser!(u32).range(1..))]
        priority: u32,

        /// Task file, one `command args...[;num_gpus]` per line
        #[arg(short, long, conflicts_with = "command")]
        file: Option<PathBuf>,

        /// Command to run, after `--`
        #[arg(last = true, required_unless_present = "file")]
        command: Vec<String>,
    },

    /// List tasks
    List {
        /// Only show tasks in this state
        #[arg(short, long)]
        state: Option<TaskState>,

        /// Show at most this many tasks
        #[arg(short = 'm', long)]
        limit: Option<usize>,

        /// Refresh every this many seconds until interrupted
        #[arg(short = 'l', long = "loop", value_name = "SECS")]
        refresh: Option<u64>,
    },

    /// Delete a queuing task
    Delete {
        /// Task ID
        id: TaskId,
    },

    /// Change priorities: ID VALUE [ID VALUE ...]
    Priority {
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        pairs: Vec<String>,
    },
}

/// Log to stderr so table output stays clean
fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let log_level = if verbose { Level::DEBUG } else { Level::WARN };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let database = match cli.database {
        Some(path) => path,
        None => DaemonConfig::load(cli.config.as_deref())?.store.database,
    };
    let store = SqliteStore::connect(&database).await?;

    match cli.command {
        Commands::Submit {
            num_gpus,
            exclude_gpus,
            priority,
            file,
            command,
        } => match file {
            Some(path) => {
                commands::submit_file(&store, &path, &exclude_gpus, priority).await?;
            }
            None => {
                commands::submit(&store, command, num_gpus, &exclude_gpus, priority).await?;
            }
        },
        Commands::List {
            state,
            limit,
            refresh,
        } => {
            let refresh = refresh.map(Duration::from_secs);
            commands::list(&store, state, limit, refresh).await?;
        }
        Commands::Delete { id } => {
            commands::delete(&store, id).await?;
        }
        Commands::Priority { pairs } => {
            commands::update_priority(&store, &pairs).await?;
        }
    }

    Ok(())
}
