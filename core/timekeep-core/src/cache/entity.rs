//! One entity kind's cache: snapshot, freshness, in-flight coordination and
//! optimistic mutation.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use chrono::{DateTime, Utc};
use serde_json::Value;
use timekeep_protocol::{ChangeNotice, InFlightMarker, NoticeReason, PersistedEntry};
use tracing::{debug, info, warn};

use super::{CacheEvent, ChangeCause, NoticeSink, Shared};
use crate::error::SyncError;
use crate::models::{collection_items, provisional_id, unwrap_envelope, Entity};
use crate::scheduler::{SyncTask, TaskKind};

/// A change to apply optimistically and then send to the remote service.
#[derive(Debug, Clone)]
pub enum Mutation<T> {
    /// An empty id is replaced with a provisional one.
    Create(T),
    Update(T),
    Delete(String),
}

impl<T: Entity> Mutation<T> {
    fn task_kind(&self) -> TaskKind {
        match self {
            Mutation::Create(_) => TaskKind::Create,
            Mutation::Update(_) => TaskKind::Update,
            Mutation::Delete(_) => TaskKind::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    /// The server's version of the entity; `None` for deletes.
    Reconciled(Option<T>),
    /// A newer mutation on the same id was applied first; this response was
    /// discarded.
    Superseded,
}

/// An optimistically applied mutation awaiting the server.
///
/// Reconciliation happens in the background whether or not [`wait`] is
/// called; dropping the handle only discards the outcome.
///
/// [`wait`]: PendingMutation::wait
pub struct PendingMutation<T> {
    id: String,
    logical_ts: u64,
    optimistic: Option<T>,
    outcome: Receiver<Result<MutationOutcome<T>, SyncError>>,
}

impl<T> PendingMutation<T> {
    /// Id the optimistic entry was stored under (provisional for creates).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn logical_ts(&self) -> u64 {
        self.logical_ts
    }

    pub fn optimistic(&self) -> Option<&T> {
        self.optimistic.as_ref()
    }

    pub fn wait(self) -> Result<MutationOutcome<T>, SyncError> {
        self.outcome
            .recv()
            .unwrap_or(Err(SyncError::SchedulerStopped))
    }
}

/// What an optimistic mutation changed, so exactly that can be undone.
enum Delta<T> {
    Inserted { id: String },
    Replaced { previous: T },
    Removed { index: usize, previous: T },
    Nothing,
}

/// Shared result of one fetch; joiners block on it instead of fetching.
struct Flight<T> {
    result: Mutex<Option<Result<Vec<T>, SyncError>>>,
    done: Condvar,
}

impl<T: Clone> Flight<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<Vec<T>, SyncError>) {
        let mut slot = self
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<Vec<T>, SyncError> {
        let mut slot = self
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self
                .done
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

struct CacheState<T> {
    snapshot: Vec<T>,
    last_fetch_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    flight: Option<Arc<Flight<T>>>,
    peer_in_flight: Option<InFlightMarker>,
    /// Bumped whenever a fetched snapshot (ours or a peer's) is installed.
    fetch_epoch: u64,
    /// Newest mutation issued per id; rollback only undoes the newest.
    issued: HashMap<String, u64>,
    /// Newest mutation response applied per id.
    applied: HashMap<String, u64>,
    listeners: Vec<Sender<CacheEvent>>,
}

impl<T: Entity> CacheState<T> {
    fn position(&self, id: &str) -> Option<usize> {
        self.snapshot.iter().position(|item| item.id() == id)
    }

    fn is_fresh(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        let Some(fetched) = self.last_fetch_at else {
            return false;
        };
        if self.snapshot.is_empty() {
            return false;
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::MAX);
        now.signed_duration_since(fetched) < ttl
    }

    fn emit(&mut self, cause: ChangeCause) {
        let event = CacheEvent {
            kind: T::KIND,
            cause,
            len: self.snapshot.len(),
        };
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    fn live_peer(&self, now: DateTime<Utc>, max_age_secs: i64) -> Option<&InFlightMarker> {
        self.peer_in_flight
            .as_ref()
            .filter(|marker| marker.is_live(now, max_age_secs))
    }
}

pub(crate) struct CacheCore<T> {
    shared: Arc<Shared>,
    state: Mutex<CacheState<T>>,
    changed: Condvar,
}

impl<T: Entity> CacheCore<T> {
    /// Builds the cache from whatever the channel already holds.
    pub(crate) fn hydrate(shared: Arc<Shared>) -> Self {
        let persisted = match shared.channel.load(T::KIND) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, kind = %T::KIND, "Failed to load persisted cache entry");
                PersistedEntry::empty(T::KIND)
            }
        };

        let snapshot = decode_items::<T>(persisted.snapshot).unwrap_or_else(|err| {
            warn!(error = %err, kind = %T::KIND, "Discarding undecodable persisted snapshot");
            Vec::new()
        });
        let peer_in_flight = persisted
            .in_flight
            .filter(|marker| marker.instance_id != shared.instance_id);

        Self {
            state: Mutex::new(CacheState {
                snapshot,
                last_fetch_at: persisted.last_fetch_at,
                updated_at: persisted.updated_at,
                flight: None,
                peer_in_flight,
                fetch_epoch: 0,
                issued: HashMap::new(),
                applied: HashMap::new(),
                listeners: Vec::new(),
            }),
            changed: Condvar::new(),
            shared,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, reason: NoticeReason, snapshot: Option<Vec<Value>>, updated_at: DateTime<Utc>) {
        let notice = ChangeNotice {
            kind: T::KIND,
            origin: self.shared.instance_id.clone(),
            reason,
            snapshot,
            updated_at,
        };
        if let Err(err) = self.shared.channel.publish(notice) {
            warn!(error = %err, kind = %T::KIND, reason = ?reason, "Failed to publish cache notice");
        }
    }

    fn fetch(&self, force: bool) -> Result<Vec<T>, SyncError> {
        let settings = &self.shared.settings;
        let max_age = settings.in_flight_max_age.as_secs() as i64;
        let mut state = self.lock();

        if let Some(flight) = state.flight.clone() {
            drop(state);
            return flight.wait();
        }

        let peer = state
            .live_peer(Utc::now(), max_age)
            .map(|marker| marker.instance_id.clone());
        if let Some(peer) = peer {
            debug!(kind = %T::KIND, peer = %peer, "Waiting for peer fetch");
            let epoch = state.fetch_epoch;
            let (next, wait) = self
                .changed
                .wait_timeout_while(state, settings.peer_wait, |s| {
                    s.peer_in_flight.is_some() && s.flight.is_none() && s.fetch_epoch == epoch
                })
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;

            if state.fetch_epoch != epoch {
                return Ok(state.snapshot.clone());
            }
            if let Some(flight) = state.flight.clone() {
                drop(state);
                return flight.wait();
            }
            if wait.timed_out() {
                warn!(kind = %T::KIND, "Peer fetch did not finish in time; fetching directly");
                state.peer_in_flight = None;
            }
        }

        if !force && state.is_fresh(Utc::now(), settings.ttl_for(T::KIND)) {
            return Ok(state.snapshot.clone());
        }

        let flight = Arc::new(Flight::new());
        state.flight = Some(Arc::clone(&flight));
        drop(state);

        self.publish(NoticeReason::FetchStarted, None, Utc::now());
        let result = self
            .shared
            .scheduler
            .submit(SyncTask::fetch(T::KIND))
            .wait()
            .and_then(|value| {
                let items = collection_items(T::KIND, value).ok_or_else(|| SyncError::Decode {
                    entity: T::KIND,
                    message: "expected a collection".to_string(),
                })?;
                decode_items::<T>(items)
            });

        let mut state = self.lock();
        state.flight = None;
        let now = Utc::now();
        match &result {
            Ok(items) => {
                state.snapshot = items.clone();
                state.last_fetch_at = Some(now);
                state.updated_at = Some(now);
                state.fetch_epoch += 1;
                state.emit(ChangeCause::Fetched);
                let encoded = encode_items(&state.snapshot);
                drop(state);
                debug!(kind = %T::KIND, count = items.len(), "Fetched snapshot");
                self.publish(NoticeReason::Fetched, Some(encoded), now);
            }
            Err(err) => {
                drop(state);
                warn!(error = %err, kind = %T::KIND, "Fetch failed; keeping cached snapshot");
                self.publish(NoticeReason::FetchAbandoned, None, now);
            }
        }
        self.changed.notify_all();
        flight.complete(result.clone());
        result
    }

    /// Applies `mutation` locally and returns what to send plus how to undo it.
    fn apply_optimistic(
        &self,
        mutation: Mutation<T>,
        logical_ts: u64,
    ) -> (String, Option<T>, Option<Value>, Delta<T>) {
        let mut state = self.lock();
        let (id, optimistic, delta) = match mutation {
            Mutation::Create(mut value) => {
                if value.id().is_empty() {
                    value.set_id(provisional_id());
                }
                let id = value.id().to_string();
                state.snapshot.push(value.clone());
                (id.clone(), Some(value), Delta::Inserted { id })
            }
            Mutation::Update(value) => {
                let id = value.id().to_string();
                let delta = match state.position(&id) {
                    Some(index) => Delta::Replaced {
                        previous: std::mem::replace(&mut state.snapshot[index], value.clone()),
                    },
                    None => {
                        state.snapshot.push(value.clone());
                        Delta::Inserted { id: id.clone() }
                    }
                };
                (id, Some(value), delta)
            }
            Mutation::Delete(id) => {
                let delta = match state.position(&id) {
                    Some(index) => Delta::Removed {
                        index,
                        previous: state.snapshot.remove(index),
                    },
                    None => Delta::Nothing,
                };
                (id, None, delta)
            }
        };
        state.issued.insert(id.clone(), logical_ts);
        state.emit(ChangeCause::Optimistic);
        let payload = optimistic
            .as_ref()
            .and_then(|value| serde_json::to_value(value).ok());
        (id, optimistic, payload, delta)
    }

    fn rollback(&self, id: &str, logical_ts: u64, delta: Delta<T>) {
        let mut state = self.lock();
        if state.issued.get(id).copied() != Some(logical_ts) {
            debug!(kind = %T::KIND, id, "Newer mutation pending; skipping rollback");
            return;
        }
        state.issued.remove(id);
        match delta {
            Delta::Inserted { id } => {
                if let Some(index) = state.position(&id) {
                    state.snapshot.remove(index);
                }
            }
            Delta::Replaced { previous } => match state.position(previous.id()) {
                Some(index) => state.snapshot[index] = previous,
                None => state.snapshot.push(previous),
            },
            Delta::Removed { index, previous } => {
                if state.position(previous.id()).is_none() {
                    let index = index.min(state.snapshot.len());
                    state.snapshot.insert(index, previous);
                }
            }
            Delta::Nothing => {}
        }
        state.emit(ChangeCause::RolledBack);
    }

    fn reconcile(
        &self,
        kind: TaskKind,
        id: &str,
        logical_ts: u64,
        optimistic: Option<T>,
        response: Value,
    ) -> Result<MutationOutcome<T>, SyncError> {
        let authoritative = match kind {
            TaskKind::Delete => None,
            _ => match unwrap_envelope(response) {
                Value::Null => optimistic,
                Value::Object(map) if map.is_empty() => optimistic,
                value => Some(serde_json::from_value::<T>(value).map_err(|err| {
                    SyncError::Decode {
                        entity: T::KIND,
                        message: err.to_string(),
                    }
                })?),
            },
        };

        let mut state = self.lock();
        if let Some(latest) = state.applied.get(id) {
            if *latest >= logical_ts {
                return Ok(MutationOutcome::Superseded);
            }
        }
        state.applied.insert(id.to_string(), logical_ts);
        if state.issued.get(id).copied() == Some(logical_ts) {
            state.issued.remove(id);
        }

        if let Some(value) = &authoritative {
            let new_id = value.id().to_string();
            // The server id may already be cached (a fetch or peer snapshot
            // landed first); the provisional entry then just goes away.
            let provisional_at = if new_id != id {
                state.applied.insert(new_id.clone(), logical_ts);
                state.position(id).map(|index| {
                    state.snapshot.remove(index);
                    index
                })
            } else {
                None
            };
            match (state.position(&new_id), provisional_at) {
                (Some(index), _) => state.snapshot[index] = value.clone(),
                (None, Some(index)) => {
                    let index = index.min(state.snapshot.len());
                    state.snapshot.insert(index, value.clone());
                }
                (None, None) if kind == TaskKind::Create => state.snapshot.push(value.clone()),
                (None, None) => {}
            }
        }

        let now = Utc::now();
        state.updated_at = Some(now);
        state.emit(ChangeCause::Reconciled);
        let encoded = encode_items(&state.snapshot);
        drop(state);

        self.publish(NoticeReason::Mutated, Some(encoded), now);
        Ok(MutationOutcome::Reconciled(authoritative))
    }
}

impl<T: Entity> NoticeSink for CacheCore<T> {
    fn on_notice(&self, notice: &ChangeNotice) {
        let mut state = self.lock();
        match notice.reason {
            NoticeReason::FetchStarted => {
                state.peer_in_flight = Some(InFlightMarker {
                    instance_id: notice.origin.clone(),
                    started_at: notice.updated_at,
                });
            }
            NoticeReason::FetchAbandoned => {
                let owned = state
                    .peer_in_flight
                    .as_ref()
                    .map(|marker| marker.instance_id == notice.origin)
                    .unwrap_or(false);
                if owned {
                    state.peer_in_flight = None;
                }
            }
            NoticeReason::Fetched | NoticeReason::Mutated => {
                if notice.reason == NoticeReason::Fetched {
                    state.peer_in_flight = None;
                }
                let newer = match state.updated_at {
                    Some(local) => local < notice.updated_at,
                    None => true,
                };
                if !notice.carries_snapshot() {
                    debug!(kind = %T::KIND, peer = %notice.origin, "Peer notice without snapshot");
                } else if !(newer || state.snapshot.is_empty()) {
                    debug!(kind = %T::KIND, peer = %notice.origin, "Ignoring older peer snapshot");
                } else if let Some(raw) = notice.snapshot.clone() {
                    match decode_items::<T>(raw) {
                        Ok(items) => {
                            state.snapshot = items;
                            state.updated_at = Some(notice.updated_at);
                            if notice.reason == NoticeReason::Fetched {
                                state.last_fetch_at = Some(notice.updated_at);
                                state.fetch_epoch += 1;
                            }
                            state.emit(ChangeCause::Adopted);
                            debug!(kind = %T::KIND, peer = %notice.origin, "Adopted peer snapshot");
                        }
                        Err(err) => {
                            warn!(error = %err, kind = %T::KIND, "Peer snapshot did not decode");
                        }
                    }
                }
            }
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// Typed cache handle. Cheap to clone; all clones share one cache.
pub struct EntityCache<T> {
    core: Arc<CacheCore<T>>,
}

impl<T> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Entity> EntityCache<T> {
    pub(crate) fn from_core(core: Arc<CacheCore<T>>) -> Self {
        Self { core }
    }

    /// Returns the snapshot, going to the network only when it is stale,
    /// empty, or `force` is set. Concurrent callers (in this instance or a
    /// peer) share one fetch.
    pub fn fetch(&self, force: bool) -> Result<Vec<T>, SyncError> {
        self.core.fetch(force)
    }

    /// Applies `mutation` to the snapshot right away and sends it to the
    /// remote service. On failure the optimistic change is undone unless a
    /// newer mutation on the same id has been issued since.
    pub fn mutate(&self, mutation: Mutation<T>) -> Result<PendingMutation<T>, SyncError> {
        let kind = mutation.task_kind();
        let logical_ts = self.core.shared.next_logical_ts();
        let (id, optimistic, payload, delta) = self.core.apply_optimistic(mutation, logical_ts);

        if kind != TaskKind::Delete && payload.is_none() {
            self.core.rollback(&id, logical_ts, delta);
            return Err(SyncError::Decode {
                entity: T::KIND,
                message: "entity could not be serialized".to_string(),
            });
        }

        let task = SyncTask::mutation(kind, T::KIND, Some(id.clone()), payload, logical_ts);
        let handle = self.core.shared.scheduler.submit(task);
        let (tx, rx) = mpsc::channel();

        let core = Arc::clone(&self.core);
        let task_id = id.clone();
        let pending_value = optimistic.clone();
        let spawned = thread::Builder::new()
            .name("timekeep-reconcile".to_string())
            .spawn(move || {
                let outcome = match handle.wait() {
                    Ok(response) => core.reconcile(kind, &task_id, logical_ts, pending_value, response),
                    Err(SyncError::Conflict { .. }) => Ok(MutationOutcome::Superseded),
                    Err(err) => {
                        info!(error = %err, kind = %T::KIND, id = %task_id, "Rolling back optimistic change");
                        core.rollback(&task_id, logical_ts, delta);
                        Err(err)
                    }
                };
                let _ = tx.send(outcome);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to start reconcile thread");
        }

        Ok(PendingMutation {
            id,
            logical_ts,
            optimistic,
            outcome: rx,
        })
    }

    pub fn create(&self, value: T) -> Result<PendingMutation<T>, SyncError> {
        self.mutate(Mutation::Create(value))
    }

    pub fn update(&self, value: T) -> Result<PendingMutation<T>, SyncError> {
        self.mutate(Mutation::Update(value))
    }

    pub fn delete(&self, id: impl Into<String>) -> Result<PendingMutation<T>, SyncError> {
        self.mutate(Mutation::Delete(id.into()))
    }

    /// Current view, never touching the network.
    pub fn snapshot(&self) -> Vec<T> {
        self.core.lock().snapshot.clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        let state = self.core.lock();
        state.position(id).map(|index| state.snapshot[index].clone())
    }

    pub fn last_fetch_at(&self) -> Option<DateTime<Utc>> {
        self.core.lock().last_fetch_at
    }

    pub fn is_fetching(&self) -> bool {
        self.core.lock().flight.is_some()
    }

    /// Forgets freshness so the next non-forced fetch goes to the network.
    pub fn invalidate(&self) {
        let mut state = self.core.lock();
        state.last_fetch_at = None;
        state.emit(ChangeCause::Invalidated);
    }

    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (tx, rx) = mpsc::channel();
        self.core.lock().listeners.push(tx);
        rx
    }
}

fn decode_items<T: Entity>(items: Vec<Value>) -> Result<Vec<T>, SyncError> {
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<T>(item).map_err(|err| SyncError::Decode {
                entity: T::KIND,
                message: err.to_string(),
            })
        })
        .collect()
}

fn encode_items<T: Entity>(items: &[T]) -> Vec<Value> {
    items
        .iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect()
}
