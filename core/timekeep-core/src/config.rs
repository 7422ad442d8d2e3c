//! Runtime configuration loaded from `~/.timekeep/config.toml`.
//!
//! Every section and field has a default, so a missing file (or a file with
//! only the keys a user cares about) is valid.
//!
//! ```toml
//! [worker]
//! program = "/usr/local/bin/timekeep-worker"
//! args = ["--port", "4100"]
//!
//! [cache.ttl_secs]
//! time_entries = 15
//! ```

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use timekeep_protocol::EntityKind;
use tracing::warn;

use crate::cache::CacheSettings;
use crate::clock::{ClockNormalizer, SkewMode, DEFAULT_SKEW_THRESHOLD_HOURS};
use crate::error::ConfigError;
use crate::remote::HttpRemoteConfig;
use crate::scheduler::{RetryPolicy, SchedulerConfig, DEFAULT_MAX_CONCURRENT};
use crate::session::DEFAULT_CONFIRM_TOLERANCE;
use crate::supervisor::{WorkerSpec, DEFAULT_READINESS_MARKERS};

const API_URL_ENV: &str = "TIMEKEEP_API_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimekeepConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub readiness_markers: Vec<String>,
    pub start_timeout_ms: u64,
    pub grace_period_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("timekeep-worker"),
            args: Vec::new(),
            current_dir: None,
            readiness_markers: DEFAULT_READINESS_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
            start_timeout_ms: 10_000,
            grace_period_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub cap_delay_ms: u64,
    pub max_retries: u32,
}

impl From<RetryPolicy> for RetryConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            cap_delay_ms: policy.cap_delay.as_millis() as u64,
            max_retries: policy.max_retries,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            cap_delay: Duration::from_millis(config.cap_delay_ms),
            max_retries: config.max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub read: RetryConfig,
    pub write: RetryConfig,
    pub max_concurrent: usize,
    pub auth_cooldown_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read: RetryPolicy::read().into(),
            write: RetryPolicy::write().into(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            auth_cooldown_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    /// Per-kind overrides keyed by kind name, e.g. `time_entries`.
    pub ttl_secs: HashMap<String, u64>,
    pub peer_wait_ms: u64,
    pub in_flight_max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60,
            ttl_secs: HashMap::new(),
            peer_wait_ms: 15_000,
            in_flight_max_age_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub skew_threshold_hours: i64,
    pub mode: SkewMode,
    pub confirm_tolerance_secs: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            skew_threshold_hours: DEFAULT_SKEW_THRESHOLD_HOURS,
            mode: SkewMode::Rebase,
            confirm_tolerance_secs: DEFAULT_CONFIRM_TOLERANCE.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let defaults = HttpRemoteConfig::default();
        Self {
            base_url: defaults.base_url,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
        }
    }
}

impl TimekeepConfig {
    pub fn worker_spec(&self) -> WorkerSpec {
        let worker = &self.worker;
        let mut spec = WorkerSpec::new(worker.program.clone())
            .args(worker.args.iter().cloned())
            .start_timeout(Duration::from_millis(worker.start_timeout_ms))
            .grace_period(Duration::from_millis(worker.grace_period_ms));
        if !worker.readiness_markers.is_empty() {
            spec = spec.readiness_markers(worker.readiness_markers.iter().cloned());
        }
        spec.current_dir = worker.current_dir.clone();
        spec
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            read_policy: self.sync.read.into(),
            write_policy: self.sync.write.into(),
            max_concurrent: self.sync.max_concurrent.max(1),
        }
    }

    pub fn auth_cooldown(&self) -> Duration {
        Duration::from_millis(self.sync.auth_cooldown_ms)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
            ttl: self
                .cache
                .ttl_secs
                .iter()
                .filter_map(|(name, secs)| match name.parse::<EntityKind>() {
                    Ok(kind) => Some((kind, Duration::from_secs(*secs))),
                    Err(err) => {
                        warn!(error = %err, "Ignoring cache TTL override");
                        None
                    }
                })
                .collect(),
            peer_wait: Duration::from_millis(self.cache.peer_wait_ms),
            in_flight_max_age: Duration::from_secs(self.cache.in_flight_max_age_secs),
        }
    }

    pub fn clock(&self) -> ClockNormalizer {
        ClockNormalizer::new(
            chrono::Duration::hours(self.clock.skew_threshold_hours.max(1)),
            self.clock.mode,
        )
    }

    pub fn confirm_tolerance(&self) -> Duration {
        Duration::from_secs(self.clock.confirm_tolerance_secs)
    }

    pub fn remote_config(&self) -> HttpRemoteConfig {
        HttpRemoteConfig {
            base_url: self.remote.base_url.clone(),
            connect_timeout: Duration::from_millis(self.remote.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.remote.request_timeout_ms),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.remote.base_url = url.trim().to_string();
            }
        }
    }
}

/// Loads the config at `path`, falling back to defaults when the file does
/// not exist. `TIMEKEEP_API_URL` overrides `remote.base_url` either way.
pub fn load_config(path: &std::path::Path) -> Result<TimekeepConfig, ConfigError> {
    let mut config = if path.exists() {
        let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str::<TimekeepConfig>(&content).map_err(|err| ConfigError::Malformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?
    } else {
        TimekeepConfig::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(&temp_dir.path().join("missing.toml")).expect("load config");
        assert_eq!(config.worker, WorkerConfig::default());
        assert_eq!(config.sync.max_concurrent, 4);
        assert_eq!(config.clock.skew_threshold_hours, 7);
        assert_eq!(config.scheduler_config().read_policy, RetryPolicy::read());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[worker]
program = "/opt/timekeep/worker"
args = ["--port", "4100"]

[sync]
max_concurrent = 2

[sync.write]
base_delay_ms = 500
cap_delay_ms = 2000
max_retries = 2

[cache]
peer_wait_ms = 1000

[cache.ttl_secs]
time_entries = 15

[clock]
mode = "clamp_future"
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("load config");
        let spec = config.worker_spec();
        assert_eq!(spec.program, PathBuf::from("/opt/timekeep/worker"));
        assert_eq!(spec.args, vec!["--port", "4100"]);
        assert_eq!(spec.grace_period, Duration::from_secs(3));

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.max_concurrent, 2);
        assert_eq!(scheduler.write_policy.max_retries, 2);
        assert_eq!(scheduler.read_policy, RetryPolicy::read());

        let cache = config.cache_settings();
        assert_eq!(cache.ttl_for(EntityKind::TimeEntries), Duration::from_secs(15));
        assert_eq!(cache.ttl_for(EntityKind::Projects), Duration::from_secs(60));
        assert_eq!(cache.peer_wait, Duration::from_secs(1));

        assert_eq!(config.clock().mode(), SkewMode::ClampFuture);
    }

    #[test]
    fn malformed_file_is_reported() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[worker\nprogram = ").expect("write config");
        let err = load_config(&path).expect_err("malformed");
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }
}
