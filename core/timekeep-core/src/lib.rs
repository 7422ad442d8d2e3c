//! # timekeep-core
//!
//! Core library for the Timekeep desktop client: supervision of the local
//! worker process and the local-first sync/cache engine that keeps several UI
//! instances consistent with the remote service.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Background work runs on plain threads
//!   and callers block only on handles they choose to wait on.
//! - **Explicit wiring**: One [`CacheRegistry`] and one [`SyncTaskScheduler`]
//!   per UI instance, injected where needed. No global caches.
//! - **Graceful degradation**: A missing config file or cache entry yields
//!   defaults; a corrupt cache entry is ignored rather than fatal.
//! - **Message passing across instances**: Peers learn about changes through
//!   [`channel::CacheChannel`] notices, never by sharing memory.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use timekeep_core::{Project, TimekeepEngine};
//!
//! let engine = TimekeepEngine::new()?;
//! let projects = engine.registry().entity::<Project>();
//! let snapshot = projects.fetch(false)?;
//! ```

pub mod api;
pub mod auth;
pub mod cache;
pub mod channel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod timer;

pub use api::{StartEntry, SyncStatus, TimeTracker};
pub use auth::{AuthGate, TokenLease};
pub use cache::{
    CacheEvent, CacheRegistry, CacheSettings, ChangeCause, EntityCache, Mutation,
    MutationOutcome, PendingMutation,
};
pub use channel::{CacheChannel, FileChannel, MemoryChannel};
pub use clock::{ClockNormalizer, SkewMode};
pub use config::{load_config, TimekeepConfig};
pub use engine::TimekeepEngine;
pub use error::{ChannelError, ClockError, ConfigError, InitError, ProcessError, Result, SyncError};
pub use models::{Client, Entity, Organization, Project, Screenshot, Settings, Task, TimeEntry};
pub use remote::{Credentials, HttpRemote, HttpRemoteConfig, RemoteError, RemoteRequest, RemoteService};
pub use scheduler::{RetryPolicy, SchedulerConfig, SyncTask, SyncTaskScheduler, TaskHandle, TaskKind};
pub use session::{ActiveSession, StartBasis};
pub use storage::StorageConfig;
pub use supervisor::{ProcessSupervisor, WorkerSpec, WorkerState};
pub use timer::{Poller, Ticker};
