//! Sync task scheduler.
//!
//! A single loop thread owns every queued [`SyncTask`]. Due tasks are handed to
//! short-lived attempt threads (at most `max_concurrent` at a time); each
//! attempt reports back to the loop, which either completes the task, queues
//! it again with backoff, or fails it terminally.
//!
//! ```text
//! submit ──▶ queued ──(due, slot free)──▶ running ──▶ Finished
//!              ▲                                         │
//!              └──────── retryable, retries left ────────┘
//! ```
//!
//! Fetches for the same entity kind are coalesced: a second submit joins the
//! queued or running task and receives the same result.

mod stale;
mod task;

pub use stale::StaleResponseGuard;
pub use task::{RetryPolicy, SyncTask, TaskKind, TaskSnapshot};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::auth::AuthGate;
use crate::error::SyncError;
use crate::remote::{RemoteError, RemoteService};

pub type TaskResult = Result<Value, SyncError>;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub read_policy: RetryPolicy,
    pub write_policy: RetryPolicy,
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            read_policy: RetryPolicy::read(),
            write_policy: RetryPolicy::write(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// Receives the terminal outcome of a submitted task.
pub struct TaskHandle {
    task_id: u64,
    receiver: Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn wait(self) -> TaskResult {
        self.receiver
            .recv()
            .unwrap_or(Err(SyncError::SchedulerStopped))
    }
}

enum Command {
    Submit {
        task: SyncTask,
        reply: Sender<TaskResult>,
    },
    Finished {
        task: SyncTask,
        result: TaskResult,
    },
    Snapshot(Sender<Vec<TaskSnapshot>>),
    Shutdown,
}

struct Entry {
    task: SyncTask,
    waiters: Vec<Sender<TaskResult>>,
}

impl Entry {
    fn snapshot(&self, running: bool) -> TaskSnapshot {
        TaskSnapshot {
            id: self.task.id,
            kind: self.task.kind,
            entity: self.task.entity,
            entity_id: self.task.entity_id.clone(),
            retry_count: self.task.retry_count,
            running,
            waiters: self.waiters.len(),
        }
    }

    fn complete(self, result: TaskResult) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

pub struct SyncTaskScheduler {
    commands: Sender<Command>,
    next_id: AtomicU64,
    auth: Arc<AuthGate>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncTaskScheduler {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        auth: Arc<AuthGate>,
        config: SchedulerConfig,
    ) -> Self {
        let (commands, receiver) = mpsc::channel();
        let runner = SchedulerLoop {
            remote,
            auth: Arc::clone(&auth),
            config,
            guard: StaleResponseGuard::new(),
            commands: commands.clone(),
            queued: BTreeMap::new(),
            running: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("timekeep-sync".to_string())
            .spawn(move || runner.run(receiver));

        let loop_handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "Failed to start sync scheduler thread");
                None
            }
        };

        Self {
            commands,
            next_id: AtomicU64::new(1),
            auth,
            loop_handle: Mutex::new(loop_handle),
        }
    }

    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    pub fn submit(&self, mut task: SyncTask) -> TaskHandle {
        task.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        task.retry_count = 0;
        task.next_attempt_at = Instant::now();
        let task_id = task.id;
        let (reply, receiver) = mpsc::channel();
        if let Err(mpsc::SendError(Command::Submit { reply, .. })) =
            self.commands.send(Command::Submit { task, reply })
        {
            let _ = reply.send(Err(SyncError::SchedulerStopped));
        }
        TaskHandle { task_id, receiver }
    }

    /// Queued and running tasks, with their retry state.
    pub fn pending(&self) -> Vec<TaskSnapshot> {
        let (reply, receiver) = mpsc::channel();
        if self.commands.send(Command::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        receiver.recv().unwrap_or_default()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Sync scheduler thread panicked");
            }
        }
    }
}

impl Drop for SyncTaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SchedulerLoop {
    remote: Arc<dyn RemoteService>,
    auth: Arc<AuthGate>,
    config: SchedulerConfig,
    guard: StaleResponseGuard,
    commands: Sender<Command>,
    // Ordered by (next_attempt_at, id) so the first key is the next due task.
    queued: BTreeMap<(Instant, u64), Entry>,
    running: HashMap<u64, Entry>,
}

impl SchedulerLoop {
    fn run(mut self, receiver: Receiver<Command>) {
        loop {
            self.dispatch_due();

            let command = match self.next_wake() {
                Some(wait) => match receiver.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match receiver.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Submit { task, reply } => self.enqueue(task, reply),
                Command::Finished { task, result } => self.finish(task, result),
                Command::Snapshot(reply) => {
                    let mut snapshots: Vec<TaskSnapshot> = self
                        .running
                        .values()
                        .map(|entry| entry.snapshot(true))
                        .chain(self.queued.values().map(|entry| entry.snapshot(false)))
                        .collect();
                    snapshots.sort_by_key(|snapshot| snapshot.id);
                    let _ = reply.send(snapshots);
                }
                Command::Shutdown => break,
            }
        }

        debug!(
            queued = self.queued.len(),
            running = self.running.len(),
            "Sync scheduler stopping"
        );
        for (_, entry) in std::mem::take(&mut self.queued) {
            entry.complete(Err(SyncError::SchedulerStopped));
        }
        for (_, entry) in self.running.drain() {
            entry.complete(Err(SyncError::SchedulerStopped));
        }
    }

    fn next_wake(&self) -> Option<Duration> {
        if self.running.len() >= self.config.max_concurrent.max(1) {
            return None;
        }
        self.queued
            .keys()
            .next()
            .map(|(due, _)| due.saturating_duration_since(Instant::now()))
    }

    fn enqueue(&mut self, task: SyncTask, reply: Sender<TaskResult>) {
        if task.kind == TaskKind::Fetch {
            let existing = self
                .running
                .values_mut()
                .chain(self.queued.values_mut())
                .find(|entry| entry.task.same_fetch(&task));
            if let Some(entry) = existing {
                debug!(
                    entity = %task.entity,
                    joined = entry.task.id,
                    "Coalesced duplicate fetch"
                );
                entry.waiters.push(reply);
                return;
            }
        }

        self.queued.insert(
            (task.next_attempt_at, task.id),
            Entry {
                task,
                waiters: vec![reply],
            },
        );
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        while self.running.len() < self.config.max_concurrent.max(1) {
            let key = match self.queued.keys().next() {
                Some(key) if key.0 <= now => *key,
                _ => break,
            };
            let Some(entry) = self.queued.remove(&key) else {
                break;
            };
            let task = entry.task.clone();
            self.running.insert(task.id, entry);

            let remote = Arc::clone(&self.remote);
            let auth = Arc::clone(&self.auth);
            let commands = self.commands.clone();
            thread::spawn(move || {
                let result = execute_attempt(remote.as_ref(), &auth, &task);
                let _ = commands.send(Command::Finished { task, result });
            });
        }
    }

    fn finish(&mut self, mut task: SyncTask, result: TaskResult) {
        let Some(mut entry) = self.running.remove(&task.id) else {
            return;
        };

        match result {
            Ok(value) => {
                if task.kind.is_mutation() {
                    if let Some(id) = task.entity_id.as_deref() {
                        if !self.guard.admit(task.entity, id, task.logical_ts) {
                            debug!(
                                entity = %task.entity,
                                id,
                                logical_ts = task.logical_ts,
                                "Discarding stale mutation response"
                            );
                            entry.complete(Err(SyncError::Conflict {
                                entity: task.entity,
                                id: id.to_string(),
                            }));
                            return;
                        }
                    }
                }
                entry.complete(Ok(value));
            }
            Err(err) => {
                let policy = *task.policy(&self.config.read_policy, &self.config.write_policy);
                if err.is_retryable() && task.retry_count < policy.max_retries {
                    let delay = policy.delay_for(task.retry_count);
                    task.retry_count += 1;
                    task.next_attempt_at = Instant::now() + delay;
                    warn!(
                        error = %err,
                        entity = %task.entity,
                        kind = ?task.kind,
                        retry = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Sync task failed; retrying"
                    );
                    entry.task = task;
                    self.queued
                        .insert((entry.task.next_attempt_at, entry.task.id), entry);
                    return;
                }

                let terminal = if err.is_retryable() {
                    SyncError::RetriesExhausted {
                        entity: task.entity,
                        kind: task.kind,
                        attempts: task.retry_count + 1,
                        last: Box::new(err),
                    }
                } else {
                    err
                };
                warn!(
                    error = %terminal,
                    entity = %task.entity,
                    kind = ?task.kind,
                    "Sync task failed"
                );
                entry.complete(Err(terminal));
            }
        }
    }
}

/// One attempt, including the single replay after a 401-triggered refresh.
fn execute_attempt(remote: &dyn RemoteService, auth: &AuthGate, task: &SyncTask) -> TaskResult {
    let request = task.request();
    let lease = auth.lease();
    match remote.send(&request, lease.token.as_deref()) {
        Ok(value) => Ok(value),
        Err(RemoteError::Unauthorized) => {
            let replay = auth.recover(&lease, remote)?;
            match remote.send(&request, replay.token.as_deref()) {
                Ok(value) => Ok(value),
                Err(RemoteError::Unauthorized) => {
                    auth.reject(&replay);
                    Err(SyncError::AuthExpired)
                }
                Err(err) => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}
