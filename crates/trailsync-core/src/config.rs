use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATA_DIR_ENV: &str = "TRAILSYNC_DATA_DIR";
pub const RETENTION_ENV: &str = "TRAILSYNC_RETENTION_SECONDS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Trace retention window.
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,
    /// Delay after the first connect before the queue is flushed again.
    #[serde(default = "default_initial_flush_delay_ms")]
    pub initial_flush_delay_ms: u64,
    /// Self samples kept while offline for the reconnect `position:bulk`.
    #[serde(default = "default_position_backlog_cap")]
    pub position_backlog_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retention_seconds: default_retention_seconds(),
            purge_interval_ms: default_purge_interval_ms(),
            queue_cap: default_queue_cap(),
            initial_flush_delay_ms: default_initial_flush_delay_ms(),
            position_backlog_cap: default_position_backlog_cap(),
        }
    }
}

const fn default_retention_seconds() -> u64 {
    3_600
}

const fn default_purge_interval_ms() -> u64 {
    2_000
}

const fn default_queue_cap() -> usize {
    crate::queue::DEFAULT_QUEUE_CAP
}

const fn default_initial_flush_delay_ms() -> u64 {
    1_500
}

const fn default_position_backlog_cap() -> usize {
    2_000
}

impl SyncConfig {
    #[must_use]
    pub const fn retention_ms(&self) -> u64 {
        self.retention_seconds.saturating_mul(1_000)
    }

    /// # Errors
    ///
    /// Returns an error when the retention window or purge interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.retention_seconds == 0 {
            bail!("{}: retention_seconds must be greater than zero", ErrorCode::ConfigInvalid);
        }
        if self.purge_interval_ms == 0 {
            bail!("{}: purge_interval_ms must be greater than zero", ErrorCode::ConfigInvalid);
        }
        Ok(())
    }

    /// Parse TOML text. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid config TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .with_context(|| format!("{}: invalid trailsync config", ErrorCode::ConfigParseError))
    }

    /// Apply environment overrides through `lookup` (normally [`env::var`]).
    ///
    /// # Errors
    ///
    /// Returns an error if an override is not a valid number.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(RETENTION_ENV) {
            self.retention_seconds = raw.trim().parse().with_context(|| {
                format!("{}: {RETENTION_ENV}={raw} is not a number", ErrorCode::ConfigParseError)
            })?;
        }
        Ok(())
    }
}

/// Data directory: `$TRAILSYNC_DATA_DIR`, else the platform data dir.
#[must_use]
pub fn resolve_data_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = lookup(DATA_DIR_ENV).filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir().map_or_else(|| PathBuf::from(".trailsync"), |d| d.join("trailsync"))
}

/// Read `<data_dir>/config.toml`, apply overrides and validate.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed, if an
/// override is malformed, or if the result fails validation.
pub fn load_config_with(
    data_dir: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<SyncConfig> {
    let path = data_dir.join(CONFIG_FILE_NAME);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        SyncConfig::from_toml_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        SyncConfig::default()
    };
    config.apply_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}

/// [`load_config_with`] against the process environment.
///
/// # Errors
///
/// See [`load_config_with`].
pub fn load_config(data_dir: &Path) -> Result<SyncConfig> {
    load_config_with(data_dir, |key| env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_with(dir.path(), env_of(&[])).expect("load");
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.retention_ms(), 3_600_000);
        assert_eq!(config.queue_cap, 5_000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "retention_seconds = 60\n")
            .expect("write");
        let config = load_config_with(dir.path(), env_of(&[])).expect("load");
        assert_eq!(config.retention_seconds, 60);
        assert_eq!(config.purge_interval_ms, 2_000);
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "retention_seconds = 60\n")
            .expect("write");
        let config =
            load_config_with(dir.path(), env_of(&[(RETENTION_ENV, "900")])).expect("load");
        assert_eq!(config.retention_seconds, 900);
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = SyncConfig {
            retention_seconds: 0,
            ..SyncConfig::default()
        };
        let err = config.validate().expect_err("zero retention");
        assert!(err.to_string().contains("E1002"));

        let config = SyncConfig {
            purge_interval_ms: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_toml_and_bad_override_fail() {
        assert!(SyncConfig::from_toml_str("retention_seconds = \"soon\"").is_err());
        let mut config = SyncConfig::default();
        assert!(config.apply_overrides(env_of(&[(RETENTION_ENV, "abc")])).is_err());
    }

    #[test]
    fn data_dir_prefers_env() {
        let dir = resolve_data_dir(env_of(&[(DATA_DIR_ENV, "/tmp/ts")]));
        assert_eq!(dir, PathBuf::from("/tmp/ts"));
        let fallback = resolve_data_dir(env_of(&[(DATA_DIR_ENV, "  ")]));
        assert!(fallback.ends_with("trailsync") || fallback.ends_with(".trailsync"));
    }
}
