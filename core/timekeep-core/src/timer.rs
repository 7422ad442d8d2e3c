//! Recurring timers for the display tick and cache polling.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use timekeep_protocol::EntityKind;
use tracing::{debug, warn};

use crate::cache::EntityCache;
use crate::error::SyncError;
use crate::models::Entity;

/// Runs `tick` every `interval` on its own thread until dropped or stopped.
///
/// The first tick fires one interval after start. A slow tick delays the
/// next one rather than overlapping it.
pub struct Ticker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Something a [`Poller`] can refresh.
pub trait Pollable: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Refreshes if stale and returns the number of cached items.
    fn poll(&self) -> Result<usize, SyncError>;
}

impl<T: Entity> Pollable for EntityCache<T> {
    fn kind(&self) -> EntityKind {
        T::KIND
    }

    fn poll(&self) -> Result<usize, SyncError> {
        self.fetch(false).map(|items| items.len())
    }
}

/// Periodically refreshes a set of caches. Fresh caches cost nothing, so the
/// poll interval can be shorter than the cache TTLs.
pub struct Poller {
    _ticker: Ticker,
}

impl Poller {
    pub fn start(interval: Duration, targets: Vec<Box<dyn Pollable>>) -> std::io::Result<Self> {
        let ticker = Ticker::start("timekeep-poller", interval, move || {
            for target in &targets {
                match target.poll() {
                    Ok(count) => debug!(kind = %target.kind(), count, "Polled cache"),
                    Err(err) => warn!(error = %err, kind = %target.kind(), "Cache poll failed"),
                }
            }
        })?;
        Ok(Self { _ticker: ticker })
    }
}
