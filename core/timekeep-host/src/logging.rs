//! Log setup for the host binary.
//!
//! Logs go to a daily-rolling file under `~/.timekeep/logs/`. When the log
//! directory can't be created, logs fall back to stderr so the host still
//! runs.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "timekeep-host.log";

fn filter() -> EnvFilter {
    let debug_enabled = env::var("TIMEKEEP_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// whole process or buffered lines are lost on exit.
pub fn init(logs_dir: &Path) -> Option<WorkerGuard> {
    if let Err(err) = fs_err::create_dir_all(logs_dir) {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!(error = %err, "Log directory unavailable; logging to stderr");
        return None;
    }

    let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}
