//! Storage configuration and path management for Timekeep.
//!
//! All on-disk locations are decided here so instances agree on where the
//! shared cache channel lives.
//!
//! ## Layout
//!
//! ```text
//! ~/.timekeep/
//! ├── config.toml
//! ├── cache/
//! │   ├── projects.json
//! │   └── time_entries.json
//! └── logs/
//! ```

use std::env;
use std::path::{Path, PathBuf};

use timekeep_protocol::EntityKind;

use crate::error::ConfigError;

const HOME_ENV: &str = "TIMEKEEP_HOME";
const ROOT_DIR: &str = ".timekeep";

/// Central configuration for all Timekeep storage paths.
///
/// Production code uses [`StorageConfig::from_env`], which honours
/// `TIMEKEEP_HOME` and otherwise points to `~/.timekeep/`.
/// Tests use [`StorageConfig::with_root`] for isolation.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = env::var(HOME_ENV) {
            if !path.trim().is_empty() {
                return Ok(Self::with_root(PathBuf::from(path)));
            }
        }
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(Self::with_root(home.join(ROOT_DIR)))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Path to one entity kind's persisted cache entry.
    /// Example: ~/.timekeep/cache/time_entries.json
    pub fn cache_entry_file(&self, kind: EntityKind) -> PathBuf {
        self.cache_dir().join(format!("{}.json", kind.as_str()))
    }

    /// Lock directory guarding writes to one kind's cache entry.
    pub fn cache_lock_dir(&self, kind: EntityKind) -> PathBuf {
        self.cache_dir().join(format!("{}.lock", kind.as_str()))
    }

    /// Recovers the entity kind from a cache entry path, if it is one.
    pub fn kind_for_cache_file(&self, path: &Path) -> Option<EntityKind> {
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        stem.parse().ok()
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(self.cache_dir())?;
        fs_err::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
