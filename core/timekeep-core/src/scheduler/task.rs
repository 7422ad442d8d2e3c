//! Sync task values and retry policy.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use timekeep_protocol::{routes, EntityKind};

use crate::remote::RemoteRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Fetch,
    Create,
    Update,
    Delete,
}

impl TaskKind {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, TaskKind::Fetch)
    }
}

/// `delay = min(base * 2^retry_count, cap)`, up to `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub cap_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub const fn read() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(16),
            max_retries: 5,
        }
    }

    pub const fn write() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(4),
            max_retries: 3,
        }
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.cap_delay)
            .min(self.cap_delay)
    }
}

/// One queued operation against the remote service.
///
/// Retry state lives on the value itself so the scheduler loop (and tests)
/// can inspect it between attempts.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub id: u64,
    pub kind: TaskKind,
    pub entity: EntityKind,
    pub entity_id: Option<String>,
    pub payload: Option<Value>,
    /// Overrides the entity's collection route (action endpoints).
    pub route: Option<String>,
    /// Mutation ordering stamp; zero for fetches.
    pub logical_ts: u64,
    pub retry_count: u32,
    pub next_attempt_at: Instant,
}

impl SyncTask {
    pub fn fetch(entity: EntityKind) -> Self {
        Self::new(TaskKind::Fetch, entity)
    }

    pub fn mutation(
        kind: TaskKind,
        entity: EntityKind,
        entity_id: Option<String>,
        payload: Option<Value>,
        logical_ts: u64,
    ) -> Self {
        Self {
            entity_id,
            payload,
            logical_ts,
            ..Self::new(kind, entity)
        }
    }

    /// A task against a non-collection endpoint such as
    /// `/api/time-entries/start`.
    pub fn action(
        kind: TaskKind,
        entity: EntityKind,
        route: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            route: Some(route.into()),
            payload,
            ..Self::new(kind, entity)
        }
    }

    fn new(kind: TaskKind, entity: EntityKind) -> Self {
        Self {
            id: 0,
            kind,
            entity,
            entity_id: None,
            payload: None,
            route: None,
            logical_ts: 0,
            retry_count: 0,
            next_attempt_at: Instant::now(),
        }
    }

    pub fn policy<'a>(&self, read: &'a RetryPolicy, write: &'a RetryPolicy) -> &'a RetryPolicy {
        if self.kind.is_mutation() {
            write
        } else {
            read
        }
    }

    /// Whether `other` asks the remote for exactly the same read.
    pub fn same_fetch(&self, other: &SyncTask) -> bool {
        self.kind == TaskKind::Fetch
            && other.kind == TaskKind::Fetch
            && self.entity == other.entity
            && self.route == other.route
    }

    pub fn request(&self) -> RemoteRequest {
        let collection = self.entity.collection_route();
        let target = |with_id: bool| -> String {
            match (&self.route, &self.entity_id) {
                (Some(route), _) => route.clone(),
                (None, Some(id)) if with_id && !self.entity.is_singleton() => {
                    routes::item(collection, id)
                }
                (None, _) => collection.to_string(),
            }
        };

        match self.kind {
            TaskKind::Fetch => RemoteRequest::get(target(false)),
            TaskKind::Create => RemoteRequest::post(target(false), self.payload.clone()),
            TaskKind::Update => RemoteRequest::put(
                target(true),
                self.payload.clone().unwrap_or(Value::Null),
            ),
            TaskKind::Delete => RemoteRequest::delete(target(true)),
        }
    }
}

/// Read-only view of a queued or running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: u64,
    pub kind: TaskKind,
    pub entity: EntityKind,
    pub entity_id: Option<String>,
    pub retry_count: u32,
    pub running: bool,
    pub waiters: usize,
}
