//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum cached suggestions per mounted step
    pub suggestion_capacity: u64,
    /// Suggestion expiry in seconds; unset keeps entries until invalidated
    pub suggestion_ttl_secs: Option<u64>,
    /// Default regeneration budget handed to modify workflows
    pub max_regenerations: u32,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Emit JSON log lines
    pub log_json: bool,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With suggestion capacity
    #[inline]
    #[must_use]
    pub fn with_suggestion_capacity(mut self, capacity: u64) -> Self {
        self.suggestion_capacity = capacity;
        self
    }

    /// With suggestion TTL
    #[inline]
    #[must_use]
    pub fn with_suggestion_ttl(mut self, ttl: Duration) -> Self {
        self.suggestion_ttl_secs = Some(ttl.as_secs());
        self
    }

    /// With regeneration budget
    #[inline]
    #[must_use]
    pub fn with_max_regenerations(mut self, max: u32) -> Self {
        self.max_regenerations = max;
        self
    }

    /// With log filter
    #[inline]
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Suggestion TTL as a duration
    #[inline]
    #[must_use]
    pub fn suggestion_ttl(&self) -> Option<Duration> {
        self.suggestion_ttl_secs.map(Duration::from_secs)
    }

    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suggestion_capacity: 256,
            suggestion_ttl_secs: None,
            max_regenerations: 3,
            log_filter: "substep_core=info,substep=info".to_string(),
            log_json: false,
        }
    }
}
