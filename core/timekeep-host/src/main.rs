//! timekeep-host: runs the core for one Timekeep UI instance.
//!
//! ## Subcommands
//!
//! - `run`: supervise the worker, poll caches and tick the active session
//!   until stdin closes
//! - `fetch`: print one entity kind's snapshot as JSON
//! - `elapsed`: print normalised elapsed seconds for a server timestamp
//! - `worker-check`: start the worker, wait for readiness, then stop it

mod logging;

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use timekeep_core::timer::Pollable;
use timekeep_core::{
    load_config, CacheRegistry, Client, Credentials, Entity, Organization, Poller,
    ProcessSupervisor, Project, Screenshot, Settings, StorageConfig, SyncError, Task, Ticker,
    TimeEntry, TimekeepEngine,
};
use timekeep_protocol::EntityKind;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "timekeep-host")]
#[command(about = "Timekeep desktop client host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the worker and keep caches fresh until stdin closes
    Run {
        /// Seconds between cache polls
        #[arg(long, default_value_t = 30)]
        poll_secs: u64,
    },

    /// Print the cached snapshot of one entity kind
    Fetch {
        /// Entity kind (projects, tasks, clients, time-entries, ...)
        #[arg(value_name = "KIND")]
        kind: String,

        /// Bypass the freshness window
        #[arg(long)]
        force: bool,
    },

    /// Print elapsed seconds since a server timestamp, skew-corrected
    Elapsed {
        #[arg(value_name = "TIMESTAMP")]
        timestamp: String,
    },

    /// Start the worker, wait for readiness, then stop it
    WorkerCheck,
}

fn main() {
    let storage = match StorageConfig::from_env() {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("timekeep-host: {}", err);
            std::process::exit(1);
        }
    };
    let _logging_guard = logging::init(&storage.logs_dir());
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { poll_secs } => run(storage, Duration::from_secs(poll_secs.max(1))),
        Commands::Fetch { kind, force } => fetch(storage, &kind, force),
        Commands::Elapsed { timestamp } => elapsed(&storage, &timestamp),
        Commands::WorkerCheck => worker_check(&storage),
    };
    if let Err(e) = result {
        error!(error = %e, "timekeep-host failed");
        eprintln!("timekeep-host: {}", e);
        std::process::exit(1);
    }
}

/// Session tokens handed over by the UI shell.
fn env_credentials() -> Option<Credentials> {
    let access_token = std::env::var("TIMEKEEP_TOKEN").ok()?;
    if access_token.trim().is_empty() {
        return None;
    }
    Some(Credentials {
        access_token,
        refresh_token: std::env::var("TIMEKEEP_REFRESH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty()),
    })
}

fn engine(storage: StorageConfig) -> Result<TimekeepEngine, String> {
    let engine = TimekeepEngine::with_storage(storage).map_err(|e| e.to_string())?;
    match env_credentials() {
        Some(credentials) => engine.auth().set_credentials(credentials),
        None => warn!("TIMEKEEP_TOKEN not set; remote requests will be unauthenticated"),
    }
    Ok(engine)
}

fn pollables(registry: &CacheRegistry) -> Vec<Box<dyn Pollable>> {
    vec![
        Box::new(registry.entity::<Project>()),
        Box::new(registry.entity::<Task>()),
        Box::new(registry.entity::<Client>()),
        Box::new(registry.entity::<TimeEntry>()),
        Box::new(registry.entity::<Settings>()),
        Box::new(registry.entity::<Organization>()),
    ]
}

fn run(storage: StorageConfig, poll_interval: Duration) -> Result<(), String> {
    let engine = Arc::new(engine(storage)?);

    engine
        .supervisor()
        .start()
        .map_err(|e| format!("Worker failed to start: {}", e))?;
    info!(pid = ?engine.supervisor().pid(), "Worker running");

    match engine.tracker().resume() {
        Ok(Some(session)) => info!(id = ?session.id(), "Resumed running time entry"),
        Ok(None) => debug!("No running time entry"),
        Err(e) => warn!(error = %e, "Could not check for a running time entry"),
    }

    let poller = Poller::start(poll_interval, pollables(engine.registry()))
        .map_err(|e| format!("Failed to start poller: {}", e))?;

    let expired = engine.auth().subscribe_expired();
    let ticking = Arc::clone(&engine);
    let mut last_state = engine.supervisor().state();
    let ticker = Ticker::start("timekeep-display-tick", Duration::from_secs(1), move || {
        if expired.try_recv().is_ok() {
            warn!("Session expired; sign in again");
        }
        let state = ticking.supervisor().state();
        if state != last_state {
            warn!(from = ?last_state, to = ?state, "Worker state changed");
            last_state = state;
        }
        if let Some(elapsed) = ticking.tracker().elapsed_seconds() {
            debug!(elapsed_secs = elapsed, "Active session tick");
        }
    })
    .map_err(|e| format!("Failed to start display tick: {}", e))?;

    // The UI shell keeps stdin open for as long as it wants us alive.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if line.trim() == "status" => {
                info!(
                    worker = ?engine.supervisor().state(),
                    elapsed_secs = ?engine.tracker().elapsed_seconds(),
                    pending_tasks = engine.scheduler().pending().len(),
                    "Status"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "stdin read failed; shutting down");
                break;
            }
        }
    }

    info!("stdin closed; shutting down");
    drop(ticker);
    drop(poller);
    engine.supervisor().stop();
    engine.scheduler().shutdown();
    Ok(())
}

fn snapshot_json<T: Entity>(registry: &CacheRegistry, force: bool) -> Result<Value, SyncError> {
    let items = registry.entity::<T>().fetch(force)?;
    serde_json::to_value(items).map_err(|e| SyncError::Decode {
        entity: T::KIND,
        message: e.to_string(),
    })
}

fn fetch(storage: StorageConfig, kind: &str, force: bool) -> Result<(), String> {
    let kind: EntityKind = kind.parse()?;
    let engine = engine(storage)?;
    let registry = engine.registry();

    let value = match kind {
        EntityKind::Projects => snapshot_json::<Project>(registry, force),
        EntityKind::Tasks => snapshot_json::<Task>(registry, force),
        EntityKind::Clients => snapshot_json::<Client>(registry, force),
        EntityKind::TimeEntries => snapshot_json::<TimeEntry>(registry, force),
        EntityKind::Screenshots => snapshot_json::<Screenshot>(registry, force),
        EntityKind::Settings => snapshot_json::<Settings>(registry, force),
        EntityKind::Organizations => snapshot_json::<Organization>(registry, force),
    }
    .map_err(|e| e.to_string())?;

    let rendered = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
    println!("{}", rendered);
    engine.scheduler().shutdown();
    Ok(())
}

fn elapsed(storage: &StorageConfig, timestamp: &str) -> Result<(), String> {
    let config = load_config(&storage.config_file()).map_err(|e| e.to_string())?;
    let seconds = config
        .clock()
        .elapsed_seconds(timestamp)
        .map_err(|e| e.to_string())?;
    println!("{}", seconds);
    Ok(())
}

fn worker_check(storage: &StorageConfig) -> Result<(), String> {
    let config = load_config(&storage.config_file()).map_err(|e| e.to_string())?;
    let supervisor = ProcessSupervisor::new(config.worker_spec());

    let result = supervisor.start();
    let pid = supervisor.pid();
    supervisor.stop();
    match result {
        Ok(()) => {
            println!("worker ready (pid {})", pid.map(|p| p.to_string()).unwrap_or_default());
            Ok(())
        }
        Err(e) => Err(format!("worker not ready: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_accepts_kind_and_force() {
        let cli = Cli::try_parse_from(["timekeep-host", "fetch", "time-entries", "--force"])
            .expect("parse");
        match cli.command {
            Commands::Fetch { kind, force } => {
                assert_eq!(kind.parse::<EntityKind>(), Ok(EntityKind::TimeEntries));
                assert!(force);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn run_defaults_poll_interval() {
        let cli = Cli::try_parse_from(["timekeep-host", "run"]).expect("parse");
        assert!(matches!(cli.command, Commands::Run { poll_secs: 30 }));
    }

    #[test]
    fn elapsed_requires_timestamp() {
        assert!(Cli::try_parse_from(["timekeep-host", "elapsed"]).is_err());
    }
}
