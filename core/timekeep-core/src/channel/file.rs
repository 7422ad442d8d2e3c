//! File-backed cache channel.
//!
//! Each entity kind is one JSON file under `cache/`. Writers replace the file
//! atomically (temp file + rename) and peers learn about the change through a
//! directory watcher, which rebuilds the notice from the entry's
//! `updated_by`/`last_reason` fields.
//!
//! A publish is a read-modify-write of the whole entry, so writers in
//! different processes serialize on a `cache/<kind>.lock/` directory.
//! `create_dir` either creates it or fails with `AlreadyExists`, which makes
//! it usable as a lock without platform file-locking APIs.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tempfile::NamedTempFile;
use timekeep_protocol::{parse_entry, ChangeNotice, EntityKind, NoticeReason, PersistedEntry};
use tracing::{debug, warn};

use super::{CacheChannel, Subscribers};
use crate::error::ChannelError;
use crate::storage::StorageConfig;

const WATCH_POLL: Duration = Duration::from_millis(250);
const LOCK_RETRY: Duration = Duration::from_millis(5);
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
// A lock this old belongs to a writer that died mid-publish.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

pub struct FileChannel {
    storage: StorageConfig,
    subscribers: Arc<Subscribers>,
    write_lock: Mutex<()>,
    stop: Arc<AtomicBool>,
    watch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileChannel {
    pub fn open(storage: StorageConfig) -> Result<Self, ChannelError> {
        let cache_dir = storage.cache_dir();
        fs_err::create_dir_all(&cache_dir).map_err(|source| ChannelError::Io {
            context: "Failed to create cache directory".to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            })
            .map_err(|e| ChannelError::Watch(e.to_string()))?;
        watcher
            .watch(&cache_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ChannelError::Watch(e.to_string()))?;

        let subscribers = Arc::new(Subscribers::default());
        let stop = Arc::new(AtomicBool::new(false));
        let watch = WatchLoop {
            storage: storage.clone(),
            subscribers: Arc::clone(&subscribers),
            stop: Arc::clone(&stop),
            delivered: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("timekeep-cache-watch".to_string())
            .spawn(move || watch.run(watcher, rx))
            .map_err(|source| ChannelError::Io {
                context: "Failed to start cache watcher thread".to_string(),
                source,
            })?;

        Ok(Self {
            storage,
            subscribers,
            write_lock: Mutex::new(()),
            stop,
            watch_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }
}

impl CacheChannel for FileChannel {
    fn load(&self, kind: EntityKind) -> Result<PersistedEntry, ChannelError> {
        let path = self.storage.cache_entry_file(kind);
        if !path.exists() {
            return Ok(PersistedEntry::empty(kind));
        }
        match read_entry(&path) {
            Ok(entry) => Ok(entry),
            Err(ChannelError::Malformed { path, details }) => {
                warn!(path = %path.display(), details = %details, "Ignoring malformed cache entry");
                Ok(PersistedEntry::empty(kind))
            }
            Err(err) => Err(err),
        }
    }

    fn publish(&self, notice: ChangeNotice) -> Result<(), ChannelError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _lock = EntryLock::acquire(self.storage.cache_lock_dir(notice.kind))?;
        let mut entry = self.load(notice.kind)?;
        entry.apply(&notice);
        write_entry(&self.storage.cache_entry_file(notice.kind), &entry)
    }

    fn subscribe(&self) -> Receiver<ChangeNotice> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.add(tx);
        rx
    }
}

impl Drop for FileChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self
            .watch_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct WatchLoop {
    storage: StorageConfig,
    subscribers: Arc<Subscribers>,
    stop: Arc<AtomicBool>,
    // One rename produces several events; only the first is forwarded.
    delivered: HashMap<EntityKind, (String, NoticeReason, DateTime<Utc>)>,
}

impl WatchLoop {
    fn run(mut self, _watcher: RecommendedWatcher, events: Receiver<Event>) {
        while !self.stop.load(Ordering::SeqCst) {
            match events.recv_timeout(WATCH_POLL) {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if let Some(kind) = self.storage.kind_for_cache_file(path) {
                            self.forward(kind, path);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn forward(&mut self, kind: EntityKind, path: &Path) {
        let entry = match read_entry(path) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, kind = %kind, "Skipping unreadable cache entry");
                return;
            }
        };
        let Some(notice) = entry.last_notice() else {
            return;
        };
        let key = (notice.origin.clone(), notice.reason, notice.updated_at);
        if self.delivered.get(&kind) == Some(&key) {
            return;
        }
        self.delivered.insert(kind, key);
        self.subscribers.broadcast(&notice);
    }
}

/// Held for the duration of one publish; released on drop.
struct EntryLock {
    path: PathBuf,
}

impl EntryLock {
    fn acquire(path: PathBuf) -> Result<Self, ChannelError> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs_err::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(path = %path.display(), "Removing stale cache entry lock");
                        let _ = fs_err::remove_dir(&path);
                        continue;
                    }
                }
                Err(source) => {
                    return Err(ChannelError::Io {
                        context: "Failed to create cache entry lock".to_string(),
                        source,
                    })
                }
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::Locked { path });
            }
            thread::sleep(LOCK_RETRY);
        }
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        if let Err(err) = fs_err::remove_dir(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, "Failed to release cache entry lock");
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

fn read_entry(path: &Path) -> Result<PersistedEntry, ChannelError> {
    let bytes = fs_err::read(path).map_err(|source| ChannelError::Io {
        context: "Failed to read cache entry".to_string(),
        source,
    })?;
    parse_entry(&bytes).map_err(|details| ChannelError::Malformed {
        path: path.to_path_buf(),
        details,
    })
}

/// Temp file in the same directory, then rename (atomic on one filesystem).
fn write_entry(path: &Path, entry: &PersistedEntry) -> Result<(), ChannelError> {
    let content = serde_json::to_vec(entry).map_err(|source| ChannelError::Json {
        context: format!("Failed to serialize {} cache entry", entry.kind),
        source,
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|source| ChannelError::Io {
        context: "Failed to create temp file".to_string(),
        source,
    })?;
    tmp.write_all(&content).map_err(|source| ChannelError::Io {
        context: "Failed to write temp file".to_string(),
        source,
    })?;
    tmp.flush().map_err(|source| ChannelError::Io {
        context: "Failed to flush temp file".to_string(),
        source,
    })?;
    tmp.persist(path).map_err(|e| ChannelError::Io {
        context: format!("Failed to persist {}", path.display()),
        source: e.error,
    })?;
    Ok(())
}
