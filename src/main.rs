// ABOUTME: CLI entry point for database-bisync
// ABOUTME: Parses commands, sets up logging and background mode, and routes to command handlers

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use database_bisync::commands::{self, RunOptions};
use database_bisync::daemon::{DaemonPaths, Detached};
use database_bisync::Side;
use sync_journal::ConflictStatus;

#[derive(Parser)]
#[command(name = "database-bisync")]
#[command(about = "Bidirectional sync between MySQL, PostgreSQL, and SQLite tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the sync configuration file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "BISYNC_CONFIG",
        default_value = "bisync.toml"
    )]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync engine; with --auto-start the scheduler keeps running until stopped
    Run {
        /// Start the scheduler immediately
        #[arg(long)]
        auto_start: bool,
        /// Detach and run in the background (PID and log file in ~/.database-bisync)
        #[arg(long, alias = "minimized")]
        background: bool,
        /// Stop a running background scheduler
        #[arg(long, conflicts_with_all = ["background", "daemon_status"])]
        stop: bool,
        /// Show status of the background scheduler
        #[arg(long)]
        daemon_status: bool,
        /// Set by the parent when it respawns itself in the background (Windows)
        #[arg(long = "daemon-child", hide = true)]
        daemon_child: bool,
    },
    /// Install changelog tables and capture triggers for every pair
    Setup,
    /// Remove capture triggers and changelog tables for every pair
    Teardown,
    /// Run one sync cycle and wait for it
    Sync {
        /// Only sync this pair
        #[arg(long)]
        pair: Option<String>,
    },
    /// Show per-pair state, last success, open conflicts, and statistics
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// List or resolve recorded conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Validate the configuration against the live databases
    Validate,
    /// Test the connection to every endpoint
    Check,
    /// List user tables of an endpoint
    Tables {
        /// Endpoint id from the configuration
        endpoint: String,
    },
    /// Delete changelog rows every peer has applied
    Compact {
        /// Only compact this pair
        #[arg(long)]
        pair: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts, newest first
    List {
        #[arg(long)]
        pair: Option<String>,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    /// Settle an open conflict by keeping one side's current row
    Resolve {
        conflict_id: i64,
        #[arg(long, value_enum)]
        side: SideArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SideArg {
    Local,
    Remote,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Local => Side::Local,
            SideArg::Remote => Side::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Open,
    Resolved,
    AutoResolved,
}

impl From<StatusArg> for ConflictStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Open => ConflictStatus::Open,
            StatusArg::Resolved => ConflictStatus::Resolved,
            StatusArg::AutoResolved => ConflictStatus::AutoResolved,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Background control and detaching happen before the runtime exists; forking a
    // running tokio runtime is not supported.
    let mut background = false;
    if let Commands::Run {
        background: detach,
        stop,
        daemon_status,
        daemon_child,
        ..
    } = &cli.command
    {
        let paths = DaemonPaths::default_location()?;
        if *stop {
            if paths.stop()? {
                println!("Background scheduler stopped");
            } else {
                println!("No background scheduler was running");
            }
            return Ok(());
        }
        if *daemon_status {
            return paths.print_status();
        }
        if *daemon_child {
            paths.write_pid()?;
            background = true;
        } else if *detach {
            match paths.detach()? {
                Detached::InDaemon => background = true,
                Detached::Spawned(pid) => {
                    println!("Background scheduler started with PID: {}", pid);
                    return Ok(());
                }
            }
        }
    }

    init_logging(&cli.log, background)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(dispatch(cli, background));

    if background {
        if let Err(e) = DaemonPaths::default_location().and_then(|p| p.remove_pid_file()) {
            tracing::warn!("Failed to clean up PID file: {}", e);
        }
    }
    result
}

/// `RUST_LOG` takes precedence over `--log`. In background mode output goes to the daemon log.
fn init_logging(level: &str, background: bool) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if background {
        if let Some(file) = background_log_file()? {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
            return Ok(());
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(!background)
        .init();
    Ok(())
}

/// The respawned Windows child has no inherited output, so it appends to the log itself.
#[cfg(windows)]
fn background_log_file() -> anyhow::Result<Option<std::fs::File>> {
    let log_file = DaemonPaths::default_location()?.log_file();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to open log file: {:?}", log_file))?;
    Ok(Some(file))
}

/// The daemonized process already has stdout and stderr pointed at the log file.
#[cfg(not(windows))]
fn background_log_file() -> anyhow::Result<Option<std::fs::File>> {
    Ok(None)
}

async fn dispatch(cli: Cli, background: bool) -> anyhow::Result<()> {
    let engine = commands::load_engine(&cli.config)?;
    match cli.command {
        Commands::Run { auto_start, .. } => {
            commands::run(
                engine,
                RunOptions {
                    auto_start,
                    background,
                },
            )
            .await
        }
        Commands::Setup => commands::setup(&engine).await,
        Commands::Teardown => commands::teardown(&engine).await,
        Commands::Sync { pair } => commands::sync(&engine, pair.as_deref()).await,
        Commands::Status { json } => commands::status(&engine, json).await,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { pair, status } => {
                commands::list_conflicts(&engine, pair.as_deref(), status.map(Into::into)).await
            }
            ConflictCommands::Resolve { conflict_id, side } => {
                commands::resolve_conflict(&engine, conflict_id, side.into()).await
            }
        },
        Commands::Validate => commands::validate(&engine).await,
        Commands::Check => commands::check(&engine).await,
        Commands::Tables { endpoint } => commands::tables(&engine, &endpoint).await,
        Commands::Compact { pair } => commands::compact(&engine, pair.as_deref()).await,
    }
}
