//! Action endpoints that are not plain collection CRUD: the time-entry
//! start/stop/current trio and the sync status/trigger pair.
//!
//! They go through the scheduler like any other task so they share its retry
//! and auth handling.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use timekeep_protocol::{routes, EntityKind};
use tracing::{debug, info, warn};

use crate::clock::ClockNormalizer;
use crate::error::SyncError;
use crate::models::{unwrap_envelope, TimeEntry};
use crate::scheduler::{SyncTask, SyncTaskScheduler, TaskKind};
use crate::session::{ActiveSession, StartBasis};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub last_synced_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn decode<T: serde::de::DeserializeOwned>(entity: EntityKind, value: Value) -> Result<T, SyncError> {
    serde_json::from_value(unwrap_envelope(value)).map_err(|err| SyncError::Decode {
        entity,
        message: err.to_string(),
    })
}

pub fn start_time_entry(
    scheduler: &SyncTaskScheduler,
    request: &StartEntry,
) -> Result<TimeEntry, SyncError> {
    let payload = serde_json::to_value(request).map_err(|err| SyncError::Decode {
        entity: EntityKind::TimeEntries,
        message: err.to_string(),
    })?;
    let task = SyncTask::action(
        TaskKind::Create,
        EntityKind::TimeEntries,
        routes::TIME_ENTRIES_START,
        Some(payload),
    );
    decode(EntityKind::TimeEntries, scheduler.submit(task).wait()?)
}

pub fn stop_time_entry(scheduler: &SyncTaskScheduler) -> Result<TimeEntry, SyncError> {
    let task = SyncTask::action(
        TaskKind::Create,
        EntityKind::TimeEntries,
        routes::TIME_ENTRIES_STOP,
        None,
    );
    decode(EntityKind::TimeEntries, scheduler.submit(task).wait()?)
}

/// The running entry, if any.
pub fn current_time_entry(scheduler: &SyncTaskScheduler) -> Result<Option<TimeEntry>, SyncError> {
    let task = SyncTask::action(
        TaskKind::Fetch,
        EntityKind::TimeEntries,
        routes::TIME_ENTRIES_CURRENT,
        None,
    );
    match unwrap_envelope(scheduler.submit(task).wait()?) {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        value => decode(EntityKind::TimeEntries, value).map(Some),
    }
}

pub fn sync_status(scheduler: &SyncTaskScheduler) -> Result<SyncStatus, SyncError> {
    let task = SyncTask::action(TaskKind::Fetch, EntityKind::Settings, routes::SYNC_STATUS, None);
    decode(EntityKind::Settings, scheduler.submit(task).wait()?)
}

pub fn trigger_sync(scheduler: &SyncTaskScheduler) -> Result<Value, SyncError> {
    let task = SyncTask::action(TaskKind::Create, EntityKind::Settings, routes::SYNC_TRIGGER, None);
    scheduler.submit(task).wait()
}

/// Applies the entry returned by the start endpoint to the tracked session.
/// If the session was cleared while the request was in flight, the entry is
/// running on the server anyway, so it is adopted as a resumed session.
fn settle_start(
    slot: &mut Option<ActiveSession>,
    entry: &TimeEntry,
    clock: ClockNormalizer,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<StartBasis, SyncError> {
    if let Some(session) = slot.as_mut() {
        return Ok(match session.confirm_entry(entry, now) {
            Ok(basis) => basis,
            Err(err) => {
                warn!(error = %err, id = %entry.id, "Start confirmation without usable start time");
                session.basis()
            }
        });
    }

    let session = ActiveSession::resume(entry, clock, tolerance, now).map_err(|err| {
        warn!(error = %err, id = %entry.id, "Started entry has an unusable start time");
        SyncError::Decode {
            entity: EntityKind::TimeEntries,
            message: err.to_string(),
        }
    })?;
    debug!(id = %entry.id, "Session was cleared mid-start; adopting server entry");
    let basis = session.basis();
    *slot = Some(session);
    Ok(basis)
}

/// Owns the active session and keeps it in step with the start/stop
/// endpoints.
pub struct TimeTracker {
    scheduler: Arc<SyncTaskScheduler>,
    clock: ClockNormalizer,
    tolerance: Duration,
    session: Mutex<Option<ActiveSession>>,
}

impl TimeTracker {
    pub fn new(scheduler: Arc<SyncTaskScheduler>, clock: ClockNormalizer, tolerance: Duration) -> Self {
        Self {
            scheduler,
            clock,
            tolerance,
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session(&self) -> Option<ActiveSession> {
        self.lock().clone()
    }

    pub fn elapsed_seconds(&self) -> Option<u64> {
        self.lock().as_ref().map(ActiveSession::elapsed_seconds)
    }

    /// Picks up an entry that is already running on the server.
    pub fn resume(&self) -> Result<Option<ActiveSession>, SyncError> {
        let Some(entry) = current_time_entry(&self.scheduler)? else {
            *self.lock() = None;
            return Ok(None);
        };
        match ActiveSession::resume(&entry, self.clock, self.tolerance, Utc::now()) {
            Ok(session) => {
                *self.lock() = Some(session.clone());
                Ok(Some(session))
            }
            Err(err) => {
                warn!(error = %err, id = %entry.id, "Running entry has an unusable start time");
                Err(SyncError::Decode {
                    entity: EntityKind::TimeEntries,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Shows the timer running right away, then confirms with the server.
    /// On failure the optimistic session is discarded.
    pub fn start(&self, request: &StartEntry) -> Result<StartBasis, SyncError> {
        *self.lock() = Some(ActiveSession::begin(Utc::now(), self.clock, self.tolerance));

        let entry = match start_time_entry(&self.scheduler, request) {
            Ok(entry) => entry,
            Err(err) => {
                *self.lock() = None;
                return Err(err);
            }
        };

        let basis = settle_start(
            &mut self.lock(),
            &entry,
            self.clock,
            self.tolerance,
            Utc::now(),
        )?;
        info!(id = %entry.id, basis = ?basis, "Time entry started");
        Ok(basis)
    }

    /// Freezes the timer immediately and returns the server's final entry.
    pub fn stop(&self) -> Result<TimeEntry, SyncError> {
        if let Some(session) = self.lock().as_mut() {
            session.stop_requested(Utc::now());
        }
        let entry = stop_time_entry(&self.scheduler)?;
        if let Some(session) = self.lock().as_mut() {
            let duration = session.stop_confirmed(entry.duration, Utc::now());
            info!(id = %entry.id, duration_secs = duration, "Time entry stopped");
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, SecondsFormat};
    use serde_json::json;

    use crate::session::DEFAULT_CONFIRM_TOLERANCE;

    fn entry(value: Value) -> TimeEntry {
        serde_json::from_value(value).expect("entry")
    }

    #[test]
    fn start_confirmation_adopts_entry_when_session_was_cleared() {
        let now = Utc::now();
        let started = (now - ChronoDuration::seconds(3)).to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut slot = None;

        let basis = settle_start(
            &mut slot,
            &entry(json!({"id": 41, "start_time": started, "is_active": true})),
            ClockNormalizer::default(),
            DEFAULT_CONFIRM_TOLERANCE,
            now,
        )
        .expect("adopted");

        assert_eq!(basis, StartBasis::Server);
        let session = slot.expect("session tracked");
        assert_eq!(session.id(), Some("41"));
        assert!(session.is_active());
        assert_eq!(session.elapsed_seconds_at(now), 3);
    }

    #[test]
    fn start_confirmation_without_start_time_leaves_cleared_session_empty() {
        let mut slot = None;
        let err = settle_start(
            &mut slot,
            &entry(json!({"id": 41})),
            ClockNormalizer::default(),
            DEFAULT_CONFIRM_TOLERANCE,
            Utc::now(),
        )
        .expect_err("nothing to adopt");
        assert!(matches!(err, SyncError::Decode { entity: EntityKind::TimeEntries, .. }));
        assert!(slot.is_none());
    }

    #[test]
    fn start_confirmation_updates_existing_session() {
        let now = Utc::now();
        let mut slot = Some(ActiveSession::begin(
            now,
            ClockNormalizer::default(),
            DEFAULT_CONFIRM_TOLERANCE,
        ));
        let basis = settle_start(
            &mut slot,
            &entry(json!({"id": "e7", "start_time": now.to_rfc3339()})),
            ClockNormalizer::default(),
            DEFAULT_CONFIRM_TOLERANCE,
            now,
        )
        .expect("confirmed");
        assert_eq!(basis, StartBasis::Server);
        assert_eq!(slot.as_ref().and_then(ActiveSession::id), Some("e7"));
    }
}
