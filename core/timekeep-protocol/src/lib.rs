//! Shared types for Timekeep UI instances and the remote API.
//!
//! Every UI instance reads and writes the same persisted cache channel, so the
//! on-disk entry format and the change notices live here to prevent schema
//! drift between instances built from different crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const CACHE_SCHEMA_VERSION: u32 = 1;
pub const MAX_SNAPSHOT_BYTES: usize = 16 * 1024 * 1024; // 16MB

pub mod routes;

/// Entity types cached by the registry. One cache entry exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Projects,
    Tasks,
    Clients,
    TimeEntries,
    Screenshots,
    Settings,
    Organizations,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Projects,
        EntityKind::Tasks,
        EntityKind::Clients,
        EntityKind::TimeEntries,
        EntityKind::Screenshots,
        EntityKind::Settings,
        EntityKind::Organizations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Projects => "projects",
            EntityKind::Tasks => "tasks",
            EntityKind::Clients => "clients",
            EntityKind::TimeEntries => "time_entries",
            EntityKind::Screenshots => "screenshots",
            EntityKind::Settings => "settings",
            EntityKind::Organizations => "organizations",
        }
    }

    /// Kinds with exactly one record, read and written at the collection
    /// route itself (`GET`/`PUT /api/settings`).
    pub fn is_singleton(&self) -> bool {
        matches!(self, EntityKind::Settings)
    }

    /// Collection route on the remote service.
    pub fn collection_route(&self) -> &'static str {
        match self {
            EntityKind::Projects => routes::PROJECTS,
            EntityKind::Tasks => routes::TASKS,
            EntityKind::Clients => routes::CLIENTS,
            EntityKind::TimeEntries => routes::TIME_ENTRIES,
            EntityKind::Screenshots => routes::SCREENSHOTS,
            EntityKind::Settings => routes::SETTINGS,
            EntityKind::Organizations => routes::ORGANIZATIONS,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown entity kind: {}", value))
    }
}

/// Marker left on the channel while an instance has a fetch outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightMarker {
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
}

impl InFlightMarker {
    /// A marker older than `max_age_secs` belongs to an instance that most
    /// likely died mid-fetch and is ignored.
    pub fn is_live(&self, now: DateTime<Utc>, max_age_secs: i64) -> bool {
        now.signed_duration_since(self.started_at).num_seconds() <= max_age_secs
    }
}

/// The persisted form of one entity kind's cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub version: u32,
    pub kind: EntityKind,
    #[serde(default)]
    pub snapshot: Vec<Value>,
    #[serde(default)]
    pub last_fetch_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub last_reason: Option<NoticeReason>,
    #[serde(default)]
    pub in_flight: Option<InFlightMarker>,
}

impl PersistedEntry {
    pub fn empty(kind: EntityKind) -> Self {
        Self {
            version: CACHE_SCHEMA_VERSION,
            kind,
            snapshot: Vec::new(),
            last_fetch_at: None,
            updated_at: None,
            updated_by: None,
            last_reason: None,
            in_flight: None,
        }
    }

    /// Folds a notice into the persisted entry. Both channel backends use
    /// this so they agree on what each notice means.
    pub fn apply(&mut self, notice: &ChangeNotice) {
        match notice.reason {
            NoticeReason::Fetched => {
                if let Some(snapshot) = &notice.snapshot {
                    self.snapshot = snapshot.clone();
                }
                self.last_fetch_at = Some(notice.updated_at);
                self.updated_at = Some(notice.updated_at);
                self.in_flight = None;
            }
            NoticeReason::Mutated => {
                if let Some(snapshot) = &notice.snapshot {
                    self.snapshot = snapshot.clone();
                }
                self.updated_at = Some(notice.updated_at);
            }
            NoticeReason::FetchStarted => {
                self.in_flight = Some(InFlightMarker {
                    instance_id: notice.origin.clone(),
                    started_at: notice.updated_at,
                });
            }
            NoticeReason::FetchAbandoned => {
                let owned = self
                    .in_flight
                    .as_ref()
                    .map(|marker| marker.instance_id == notice.origin)
                    .unwrap_or(false);
                if owned {
                    self.in_flight = None;
                }
            }
        }
        self.updated_by = Some(notice.origin.clone());
        self.last_reason = Some(notice.reason);
    }

    /// Rebuilds the notice that produced the entry's latest change.
    pub fn last_notice(&self) -> Option<ChangeNotice> {
        let reason = self.last_reason?;
        let origin = self.updated_by.clone()?;
        let updated_at = match reason {
            NoticeReason::FetchStarted => self.in_flight.as_ref().map(|m| m.started_at),
            _ => self.updated_at,
        }
        .unwrap_or_else(Utc::now);
        let snapshot = match reason {
            NoticeReason::Fetched | NoticeReason::Mutated => Some(self.snapshot.clone()),
            _ => None,
        };
        Some(ChangeNotice {
            kind: self.kind,
            origin,
            reason,
            snapshot,
            updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeReason {
    Fetched,
    Mutated,
    FetchStarted,
    FetchAbandoned,
}

/// Broadcast by an instance after it changes a cache entry.
///
/// `snapshot` and `updated_at` are carried inline so peers can adopt the new
/// state without a redundant fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub kind: EntityKind,
    pub origin: String,
    pub reason: NoticeReason,
    #[serde(default)]
    pub snapshot: Option<Vec<Value>>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeNotice {
    pub fn carries_snapshot(&self) -> bool {
        matches!(self.reason, NoticeReason::Fetched | NoticeReason::Mutated)
            && self.snapshot.is_some()
    }
}

pub fn parse_entry(bytes: &[u8]) -> Result<PersistedEntry, String> {
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(format!(
            "Cache entry exceeds maximum size ({} > {})",
            bytes.len(),
            MAX_SNAPSHOT_BYTES
        ));
    }
    let entry: PersistedEntry = serde_json::from_slice(bytes)
        .map_err(|err| format!("Failed to parse cache entry: {}", err))?;
    if entry.version != CACHE_SCHEMA_VERSION {
        return Err(format!(
            "Unsupported cache entry version {} (expected {})",
            entry.version, CACHE_SCHEMA_VERSION
        ));
    }
    Ok(entry)
}
