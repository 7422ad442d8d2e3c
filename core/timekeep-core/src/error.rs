//! Error types for timekeep-core operations.
//!
//! Sync errors are `Clone` because one fetch result fans out to every caller
//! that joined it.

use std::path::PathBuf;
use std::time::Duration;

use timekeep_protocol::EntityKind;

use crate::scheduler::TaskKind;
use crate::supervisor::WorkerState;

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Process Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker did not report readiness within {timeout:?}")]
    StartTimeout { timeout: Duration },

    #[error("Worker already active (state: {state:?})")]
    AlreadyRunning { state: WorkerState },

    #[error("Worker exited during startup (status: {status})")]
    Crashed { status: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication expired; sign in again")]
    AuthExpired,

    #[error("Request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("{kind:?} {entity} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        entity: EntityKind,
        kind: TaskKind,
        attempts: u32,
        last: Box<SyncError>,
    },

    #[error("Stale response for {entity} {id} discarded")]
    Conflict { entity: EntityKind, id: String },

    #[error("Malformed response body: {0}")]
    InvalidResponse(String),

    #[error("Failed to decode {entity} payload: {message}")]
    Decode { entity: EntityKind, message: String },

    #[error("Cache channel error: {0}")]
    Channel(String),

    #[error("Sync scheduler stopped")]
    SchedulerStopped,
}

impl SyncError {
    /// Transient failures are retried by the scheduler; everything else is
    /// terminal on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Server { .. })
    }

    /// The error that caused a terminal failure, unwrapping retry exhaustion.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<ChannelError> for SyncError {
    fn from(err: ChannelError) -> Self {
        SyncError::Channel(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Channel Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache entry malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("File watcher error: {0}")]
    Watch(String),

    #[error("Cache entry locked by another writer: {path}")]
    Locked { path: PathBuf },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Clock Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("Unrecognized timestamp: {0}")]
    Unparseable(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Initialization Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to build remote client: {0}")]
    Remote(#[from] crate::remote::RemoteError),
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_nested_exhaustion() {
        let err = SyncError::RetriesExhausted {
            entity: EntityKind::Projects,
            kind: TaskKind::Fetch,
            attempts: 6,
            last: Box::new(SyncError::Server {
                status: 503,
                message: "unavailable".to_string(),
            }),
        };
        assert!(matches!(err.root(), SyncError::Server { status: 503, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(SyncError::Network("reset".to_string()).is_retryable());
        assert!(!SyncError::AuthExpired.is_retryable());
        assert!(!SyncError::Validation {
            status: 422,
            message: "bad".to_string()
        }
        .is_retryable());
        assert!(!SyncError::InvalidResponse("expected value".to_string()).is_retryable());
    }
}
