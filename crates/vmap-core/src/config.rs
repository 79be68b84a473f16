//! Map and pipeline configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path as FsPath, PathBuf};
use vmap_error::{Result, VmapError};
use vmap_store::StoreOptions;

/// Configuration for a [`VirtualMap`](crate::VirtualMap) and its pipeline.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes:
///
/// ```json
/// { "store_dir": "/var/lib/accounts", "flush_interval": 8, "store": { "label": "accounts" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMapConfig {
    /// Directory opened by [`VirtualMap::new`](crate::VirtualMap::new).
    pub store_dir: Option<PathBuf>,
    /// Largest number of leaves a copy may hold.
    pub max_size: u64,
    /// Log a warning once a copy grows to this many leaves (0 = never).
    pub size_warning_threshold: u64,
    /// Flush a copy whose estimated delta size reaches this many bytes
    /// (0 = disabled).
    pub flush_threshold_bytes: u64,
    /// Flush every copy whose version is a multiple of this (0 = disabled).
    pub flush_interval: u64,
    /// Extra attempts after a transient I/O error during flush.
    pub flush_retry_attempts: u32,
    /// Sleep between flush attempts.
    pub flush_retry_backoff_ms: u64,
    /// Run store compaction after every flush.
    pub compact_after_flush: bool,
    pub store: StoreOptions,
}

impl Default for VirtualMapConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            max_size: 1 << 31,
            size_warning_threshold: 0,
            flush_threshold_bytes: 0,
            flush_interval: 20,
            flush_retry_attempts: 3,
            flush_retry_backoff_ms: 50,
            compact_after_flush: true,
            store: StoreOptions::default(),
        }
    }
}

impl VirtualMapConfig {
    /// Default configuration storing under `dir`.
    #[must_use]
    pub fn with_store_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(VmapError::InvalidConfig("max_size must be positive".to_owned()));
        }
        if self.size_warning_threshold > self.max_size {
            return Err(VmapError::InvalidConfig(format!(
                "size_warning_threshold {} exceeds max_size {}",
                self.size_warning_threshold, self.max_size
            )));
        }
        if self.flush_retry_backoff_ms > 60_000 {
            return Err(VmapError::InvalidConfig(format!(
                "flush_retry_backoff_ms {} is longer than a minute",
                self.flush_retry_backoff_ms
            )));
        }
        self.store.validate()
    }

    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| VmapError::InvalidConfig(format!("config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: &FsPath) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        VirtualMapConfig::default()
            .validate()
            .expect("default config");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = VirtualMapConfig::from_json(
            r#"{ "flush_interval": 4, "store": { "label": "accounts" } }"#,
        )
        .expect("parse");
        assert_eq!(config.flush_interval, 4);
        assert_eq!(config.store.label, "accounts");
        assert_eq!(config.flush_retry_attempts, 3);
        assert!(config.store.sync_on_flush);
    }

    #[test]
    fn zero_max_size_is_rejected() {
        let err = VirtualMapConfig::from_json(r#"{ "max_size": 0 }"#).unwrap_err();
        assert!(matches!(err, VmapError::InvalidConfig(_)));
    }

    #[test]
    fn warning_above_capacity_is_rejected() {
        let config = VirtualMapConfig {
            max_size: 10,
            size_warning_threshold: 11,
            ..VirtualMapConfig::default()
        };
        assert!(matches!(config.validate(), Err(VmapError::InvalidConfig(_))));
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        let err = VirtualMapConfig::from_json("{ flush_interval: }").unwrap_err();
        assert!(matches!(err, VmapError::InvalidConfig(_)));
    }
}
