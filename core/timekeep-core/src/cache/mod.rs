//! Per-entity snapshot caches shared by every view of one UI instance.
//!
//! The host builds one [`CacheRegistry`] and hands it to whatever needs data;
//! `registry.entity::<Project>()` returns the typed cache for that kind. All
//! caches share the registry's scheduler, its cache channel and its logical
//! clock for mutation ordering.
//!
//! A background listener forwards peer [`ChangeNotice`]s from the channel to
//! the cache of the matching kind.

mod entity;

pub use entity::{EntityCache, Mutation, MutationOutcome, PendingMutation};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use timekeep_protocol::{ChangeNotice, EntityKind};
use tracing::{debug, error};

use crate::channel::CacheChannel;
use crate::models::Entity;
use crate::scheduler::SyncTaskScheduler;

const NOTICE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl: Duration,
    pub ttl: HashMap<EntityKind, Duration>,
    /// How long a fetch waits on a peer instance's in-flight fetch before
    /// issuing its own.
    pub peer_wait: Duration,
    /// In-flight markers older than this are treated as abandoned.
    pub in_flight_max_age: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            ttl: HashMap::new(),
            peer_wait: Duration::from_secs(15),
            in_flight_max_age: Duration::from_secs(60),
        }
    }
}

impl CacheSettings {
    pub fn ttl_for(&self, kind: EntityKind) -> Duration {
        self.ttl.get(&kind).copied().unwrap_or(self.default_ttl)
    }
}

/// Why a cache's snapshot changed. Delivered to [`EntityCache::subscribe`]rs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Fetched,
    Optimistic,
    Reconciled,
    RolledBack,
    Adopted,
    Invalidated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: EntityKind,
    pub cause: ChangeCause,
    pub len: usize,
}

/// State every cache of one registry shares.
pub(crate) struct Shared {
    pub(crate) scheduler: Arc<SyncTaskScheduler>,
    pub(crate) channel: Arc<dyn CacheChannel>,
    pub(crate) instance_id: String,
    pub(crate) settings: CacheSettings,
    logical_clock: AtomicU64,
}

impl Shared {
    /// Next mutation ordering stamp; strictly increasing per registry.
    pub(crate) fn next_logical_ts(&self) -> u64 {
        self.logical_clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub(crate) trait NoticeSink: Send + Sync {
    fn on_notice(&self, notice: &ChangeNotice);
}

struct Slot {
    kind: EntityKind,
    cache: Arc<dyn Any + Send + Sync>,
    sink: Arc<dyn NoticeSink>,
}

pub struct CacheRegistry {
    shared: Arc<Shared>,
    slots: Arc<Mutex<HashMap<TypeId, Slot>>>,
    stop: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CacheRegistry {
    pub fn new(
        scheduler: Arc<SyncTaskScheduler>,
        channel: Arc<dyn CacheChannel>,
        settings: CacheSettings,
    ) -> Self {
        let instance_id = ulid::Ulid::new().to_string();
        let notices = channel.subscribe();
        let shared = Arc::new(Shared {
            scheduler,
            channel,
            instance_id,
            settings,
            logical_clock: AtomicU64::new(0),
        });
        let slots: Arc<Mutex<HashMap<TypeId, Slot>>> = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let listener = {
            let slots = Arc::clone(&slots);
            let stop = Arc::clone(&stop);
            let origin = shared.instance_id.clone();
            thread::Builder::new()
                .name("timekeep-cache-notices".to_string())
                .spawn(move || listen(notices, slots, stop, origin))
        };
        let listener = match listener {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "Failed to start cache notice listener");
                None
            }
        };

        debug!(instance = %shared.instance_id, "Cache registry created");
        Self {
            shared,
            slots,
            stop,
            listener: Mutex::new(listener),
        }
    }

    /// Identifies this instance on the channel.
    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn scheduler(&self) -> &Arc<SyncTaskScheduler> {
        &self.shared.scheduler
    }

    /// The typed cache for `T`, created and hydrated from the channel on
    /// first use.
    pub fn entity<T: Entity>(&self) -> EntityCache<T> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = slots.get(&TypeId::of::<T>()) {
            if let Ok(core) = Arc::clone(&slot.cache).downcast::<entity::CacheCore<T>>() {
                return EntityCache::from_core(core);
            }
        }

        let core = Arc::new(entity::CacheCore::<T>::hydrate(Arc::clone(&self.shared)));
        slots.insert(
            TypeId::of::<T>(),
            Slot {
                kind: T::KIND,
                cache: Arc::clone(&core) as Arc<dyn Any + Send + Sync>,
                sink: Arc::clone(&core) as Arc<dyn NoticeSink>,
            },
        );
        EntityCache::from_core(core)
    }

    /// Kinds with a live cache in this registry.
    pub fn kinds(&self) -> Vec<EntityKind> {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut kinds: Vec<EntityKind> = slots.values().map(|slot| slot.kind).collect();
        kinds.sort();
        kinds
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn listen(
    notices: Receiver<ChangeNotice>,
    slots: Arc<Mutex<HashMap<TypeId, Slot>>>,
    stop: Arc<AtomicBool>,
    origin: String,
) {
    while !stop.load(Ordering::SeqCst) {
        let notice = match notices.recv_timeout(NOTICE_POLL) {
            Ok(notice) => notice,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if notice.origin == origin {
            continue;
        }
        let sinks: Vec<Arc<dyn NoticeSink>> = slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|slot| slot.kind == notice.kind)
            .map(|slot| Arc::clone(&slot.sink))
            .collect();
        for sink in sinks {
            sink.on_notice(&notice);
        }
    }
}
