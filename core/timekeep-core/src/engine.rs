//! TimekeepEngine wires the core together for one UI instance.
//!
//! ```rust,ignore
//! use timekeep_core::TimekeepEngine;
//!
//! let engine = TimekeepEngine::new()?;
//! engine.supervisor().start()?;
//! let projects = engine.registry().entity::<Project>().fetch(false)?;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::api::TimeTracker;
use crate::auth::AuthGate;
use crate::cache::CacheRegistry;
use crate::channel::{CacheChannel, FileChannel};
use crate::clock::ClockNormalizer;
use crate::config::{load_config, TimekeepConfig};
use crate::error::InitError;
use crate::remote::{HttpRemote, RemoteService};
use crate::scheduler::SyncTaskScheduler;
use crate::storage::StorageConfig;
use crate::supervisor::ProcessSupervisor;

pub struct TimekeepEngine {
    config: TimekeepConfig,
    storage: StorageConfig,
    remote: Arc<dyn RemoteService>,
    auth: Arc<AuthGate>,
    scheduler: Arc<SyncTaskScheduler>,
    registry: CacheRegistry,
    supervisor: ProcessSupervisor,
    tracker: TimeTracker,
}

impl TimekeepEngine {
    /// Uses `~/.timekeep/` (or `TIMEKEEP_HOME`), its `config.toml`, the HTTP
    /// remote and the file channel.
    pub fn new() -> Result<Self, InitError> {
        let storage = StorageConfig::from_env()?;
        Self::with_storage(storage)
    }

    pub fn with_storage(storage: StorageConfig) -> Result<Self, InitError> {
        let config = load_config(&storage.config_file())?;
        let remote: Arc<dyn RemoteService> = Arc::new(HttpRemote::new(&config.remote_config())?);
        let channel: Arc<dyn CacheChannel> = Arc::new(FileChannel::open(storage.clone())?);
        Ok(Self::with_parts(config, storage, remote, channel))
    }

    /// Assembles an engine from explicit parts. Tests inject a scripted remote
    /// and a memory channel here.
    pub fn with_parts(
        config: TimekeepConfig,
        storage: StorageConfig,
        remote: Arc<dyn RemoteService>,
        channel: Arc<dyn CacheChannel>,
    ) -> Self {
        let auth = Arc::new(AuthGate::new(config.auth_cooldown()));
        let scheduler = Arc::new(SyncTaskScheduler::new(
            Arc::clone(&remote),
            Arc::clone(&auth),
            config.scheduler_config(),
        ));
        let registry = CacheRegistry::new(Arc::clone(&scheduler), channel, config.cache_settings());
        let supervisor = ProcessSupervisor::new(config.worker_spec());
        let tracker = TimeTracker::new(
            Arc::clone(&scheduler),
            config.clock(),
            config.confirm_tolerance(),
        );
        info!(
            instance = registry.instance_id(),
            root = %storage.root().display(),
            "Timekeep engine ready"
        );

        Self {
            config,
            storage,
            remote,
            auth,
            scheduler,
            registry,
            supervisor,
            tracker,
        }
    }

    pub fn config(&self) -> &TimekeepConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.remote
    }

    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    pub fn scheduler(&self) -> &Arc<SyncTaskScheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn tracker(&self) -> &TimeTracker {
        &self.tracker
    }

    pub fn clock(&self) -> ClockNormalizer {
        self.config.clock()
    }

    pub fn login(&self, email: &str, password: &str) -> crate::error::Result<()> {
        self.auth.login(self.remote.as_ref(), email, password)
    }

    pub fn logout(&self) {
        self.auth.logout(self.remote.as_ref());
    }
}
