//! Sync configuration parsing and validation.
//!
//! All knobs the orchestrator and worker need - the working-copy root, the
//! lookback window, subprocess and feed timeouts, the concurrency bound -
//! live in one [`SyncConfig`] value passed in at construction. There is no
//! process-wide ambient state, so independent sync runs stay independently
//! testable and parallel-safe.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or shape error.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Structurally valid but semantically unusable values.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Configuration for the synchronization core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Root directory holding one working-copy subdirectory per cloned
    /// source. Created on first clone with owner-only permissions.
    #[serde(default = "default_clones_root")]
    pub clones_root: PathBuf,

    /// SQLite database holding sources and events.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How far back commit extraction looks, in days.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Execution timeout for one subordinate VCS tool invocation, in
    /// seconds.
    #[serde(default = "default_vcs_timeout_secs")]
    pub vcs_timeout_secs: u64,

    /// Request timeout for one feed fetch, in seconds.
    #[serde(default = "default_feed_timeout_secs")]
    pub feed_timeout_secs: u64,

    /// Upper bound on a fetched feed document, in bytes.
    #[serde(default = "default_max_feed_bytes")]
    pub max_feed_bytes: u64,

    /// How many sources sync concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Interval between batch runs in periodic mode, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_clones_root() -> PathBuf {
    PathBuf::from("clones")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("pulse.db")
}

const fn default_lookback_days() -> u32 {
    5
}

const fn default_vcs_timeout_secs() -> u64 {
    600
}

const fn default_feed_timeout_secs() -> u64 {
    30
}

const fn default_max_feed_bytes() -> u64 {
    2 * 1024 * 1024
}

const fn default_concurrency() -> usize {
    4
}

const fn default_poll_interval_secs() -> u64 {
    900
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            clones_root: default_clones_root(),
            database_path: default_database_path(),
            lookback_days: default_lookback_days(),
            vcs_timeout_secs: default_vcs_timeout_secs(),
            feed_timeout_secs: default_feed_timeout_secs(),
            max_feed_bytes: default_max_feed_bytes(),
            concurrency: default_concurrency(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl SyncConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make sync runs degenerate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on a zero lookback, timeout,
    /// concurrency or feed size bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_days == 0 {
            return Err(ConfigError::Validation(
                "lookback_days must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Validation(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.vcs_timeout_secs == 0 || self.feed_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.max_feed_bytes == 0 {
            return Err(ConfigError::Validation(
                "max_feed_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The lookback window as a chrono duration.
    #[must_use]
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.lookback_days))
    }

    /// Subprocess execution timeout.
    #[must_use]
    pub const fn vcs_timeout(&self) -> Duration {
        Duration::from_secs(self.vcs_timeout_secs)
    }

    /// Feed request timeout.
    #[must_use]
    pub const fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    /// Interval between batch runs in periodic mode.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = SyncConfig::from_toml("").unwrap();
        assert_eq!(config.lookback_days, 5);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.clones_root, PathBuf::from("clones"));
    }

    #[test]
    fn fields_override_defaults() {
        let config = SyncConfig::from_toml(
            r#"
            clones_root = "/var/lib/pulse/clones"
            lookback_days = 14
            concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.clones_root, PathBuf::from("/var/lib/pulse/clones"));
        assert_eq!(config.lookback_days, 14);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.vcs_timeout_secs, 600);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SyncConfig::from_toml("repo_root = \"clones\"").is_err());
    }

    #[test]
    fn degenerate_values_fail_validation() {
        assert!(matches!(
            SyncConfig::from_toml("lookback_days = 0"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            SyncConfig::from_toml("concurrency = 0"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            SyncConfig::from_toml("feed_timeout_secs = 0"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn lookback_is_rendered_in_days() {
        let config = SyncConfig::default();
        assert_eq!(config.lookback(), chrono::Duration::days(5));
    }
}
