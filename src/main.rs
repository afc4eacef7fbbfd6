use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use domfrog::cfg;
use domfrog::context::{AppContext, DataPaths};
use domfrog::daemon::{self, lock, Claim, Daemon};
use domfrog::snapshots;
use domfrog::state::HashStore;
use domfrog::ui;

/// DomFrog - backs up Dominions turn and order files as they change
#[derive(Parser)]
#[command(name = "domfrog")]
#[command(author, version, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory holding config.ini, hash.json, daemon.log and the lock
    #[arg(long, global = true, env = "DOMFROG_HOME")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup daemon until interrupted
    Daemon,

    /// Run a single backup pass now
    Once,

    /// Show daemon state and per-game backup progress
    Status,

    /// Show the loaded configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    ui::init();

    let data_dir = match cfg::resolve_data_dir(cli.data_dir) {
        Ok(dir) => dir,
        Err(e) => {
            ui::error(&format!("Error: {:#}", e));
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Daemon => cmd_daemon(data_dir).await,
        Commands::Once => cmd_once(data_dir).await,
        Commands::Status => cmd_status(data_dir, cli.verbose).await,
        Commands::Config => cmd_config(data_dir).await,
    };

    if let Err(e) = result {
        ui::error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn cmd_daemon(data_dir: PathBuf) -> Result<()> {
    let paths = DataPaths::new(&data_dir);
    let instance = match daemon::claim(&paths)? {
        Claim::Acquired(instance) => instance,
        Claim::AlreadyRunning { pid } => {
            report_already_running(pid);
            return Ok(());
        }
    };

    let ctx = AppContext::open(&data_dir)?;
    let mut daemon = Daemon::new(&ctx, instance);
    daemon.run(shutdown_signal()).await
}

async fn cmd_once(data_dir: PathBuf) -> Result<()> {
    let paths = DataPaths::new(&data_dir);
    let _instance = match daemon::claim(&paths)? {
        Claim::Acquired(instance) => instance,
        Claim::AlreadyRunning { pid } => {
            report_already_running(pid);
            ui::hint("The running daemon picks up changes on its next tick");
            return Ok(());
        }
    };

    let ctx = AppContext::open(&data_dir)?;
    match daemon::run_once(&ctx) {
        Some(report) if report.skipped => {
            ui::warn("Pass skipped, see the log for details");
        }
        Some(report) => {
            ui::success(&format!(
                "Scanned {} folders: {} snapshots created, {} failures",
                report.folders_scanned,
                report.snapshots_created,
                report.folders_failed + report.files_failed
            ));
        }
        None => {
            ui::warn("Backup engine is disabled (Mode is not 1)");
        }
    }

    Ok(())
}

async fn cmd_status(data_dir: PathBuf, verbose: bool) -> Result<()> {
    let paths = DataPaths::new(&data_dir);

    match lock::probe(&paths.lock) {
        lock::LockStatus::Free => ui::info("Daemon is not running"),
        lock::LockStatus::Running { pid } => {
            ui::success(&format!("Daemon is running (PID: {})", pid))
        }
        lock::LockStatus::Stale { pid } => ui::warn(&format!(
            "Daemon is not running; stale lock from PID {}",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        )),
    }

    let config = match cfg::load(&paths.config) {
        Ok(config) => config,
        Err(e) => {
            ui::warn(&format!("{:#}", e));
            return Ok(());
        }
    };

    if !config.engine_enabled() {
        ui::warn("Backup engine is disabled (Mode is not 1)");
    }

    let store = match HashStore::read(&paths.hash_state) {
        Ok(store) => store,
        Err(e) => {
            ui::warn(&format!("{:#}; the daemon will treat all games as new", e));
            HashStore::new()
        }
    };

    if store.is_empty() {
        ui::info("No games backed up yet");
        return Ok(());
    }

    ui::section("Games:");
    let mut rows = Vec::new();
    let mut details = Vec::new();
    for (name, state) in store.entries() {
        let snaps = snapshots::list(&config.destination.join(name))?;
        let size: u64 = snaps.iter().map(|s| s.size_bytes).sum();
        rows.push(vec![
            name.clone(),
            state.turn_number.to_string(),
            state.save_count.to_string(),
            snaps.len().to_string(),
            humansize::format_size(size, humansize::BINARY),
        ]);
        details.push((name.clone(), snaps));
    }
    ui::print_table(&["Game", "Turn", "Save", "Snapshots", "Size"], rows);

    if verbose {
        for (name, snaps) in details {
            ui::section(&format!("{}:", name));
            for snap in snaps {
                println!(
                    "  {} ({} files, {})",
                    snap.path.display(),
                    snap.file_count,
                    humansize::format_size(snap.size_bytes, humansize::BINARY).dimmed()
                );
            }
        }
    }

    Ok(())
}

async fn cmd_config(data_dir: PathBuf) -> Result<()> {
    let paths = DataPaths::new(&data_dir);
    let config = cfg::load(&paths.config)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    ui::hint(&format!("Edit {} to change it", paths.config.display()));
    Ok(())
}

fn report_already_running(pid: Option<u32>) {
    match pid {
        Some(pid) => ui::info(&format!("Daemon already running with PID {}", pid)),
        None => ui::info("Daemon already running"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }

    ctrl_c().await;
}

// Without a working Ctrl-C handler the daemon runs until killed.
async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
