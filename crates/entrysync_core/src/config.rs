//! Configuration for the synchronization engine.
//!
//! [`SyncConfig`] holds the retry bounds and batch sizes used by the engine and
//! the synchronizer. It is persisted as TOML; every field has a default so a
//! partial (or empty) file is valid.
//!
//! # Example
//!
//! ```
//! use entrysync_core::config::SyncConfig;
//!
//! let config = SyncConfig::from_toml_str("max_update_retries = 5").unwrap();
//! assert_eq!(config.max_update_retries, 5);
//! assert_eq!(config.pull_batch_size, 100);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Default bound for optimistic update retry loops.
pub const DEFAULT_MAX_UPDATE_RETRIES: usize = 20;

/// Default bound for revert retry loops.
pub const DEFAULT_MAX_REVERT_RETRIES: usize = 20;

/// Default number of transient push failures tolerated before a mutation is reverted.
pub const DEFAULT_MAX_MUTATION_RETRIES: u32 = 10;

/// Tunables for the engine and the synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts allowed for a CAS-protected update (local or server-applied)
    pub max_update_retries: usize,

    /// Attempts allowed for a CAS-protected revert
    pub max_revert_retries: usize,

    /// Transient push failures tolerated per mutation before it is reverted
    pub max_mutation_retries: u32,

    /// Number of outbox mutations sent per push
    pub mutation_batch_size: usize,

    /// Number of server transactions requested per pull round trip
    pub pull_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_update_retries: DEFAULT_MAX_UPDATE_RETRIES,
            max_revert_retries: DEFAULT_MAX_REVERT_RETRIES,
            max_mutation_retries: DEFAULT_MAX_MUTATION_RETRIES,
            mutation_batch_size: 50,
            pull_batch_size: 100,
        }
    }
}

impl SyncConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No sync config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render the config as TOML.
    pub fn to_toml_string(&self) -> String {
        // All fields are plain integers, serialization cannot fail.
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
