//! Configuration loading.
//!
//! Each crate owns the section it consumes (`[poller]` lives next to the
//! poller, `[anomaly]` next to the detector); this module holds the
//! process-wide sections and the helpers to read a TOML file into any of
//! them. Every field carries a serde default, so an empty file is valid.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable names.
pub mod env_vars {
    /// Path of the configuration file
    pub const CONFIG: &str = "GRIDMIND_CONFIG";
    /// `true`/`1` switches log output to JSON
    pub const LOG_JSON: &str = "GRIDMIND_LOG_JSON";
}

/// Config file used when neither `--config` nor `GRIDMIND_CONFIG` is set.
pub const DEFAULT_CONFIG_FILE: &str = "gridmind.toml";

/// Default `EnvFilter` directive.
pub const DEFAULT_LOG_FILTER: &str = "gridmind=info";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// `[runtime]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Site-local offset from UTC in minutes, used for every time-of-day rule
    #[serde(default)]
    pub timezone_offset_minutes: i32,

    /// Event bus capacity per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Grace period for background tasks on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_event_capacity() -> usize {
    crate::eventbus::DEFAULT_CHANNEL_CAPACITY
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timezone_offset_minutes: 0,
            event_capacity: default_event_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Telemetry store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redb,
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file for the redb backend
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Readings kept per device by the in-memory backend
    #[serde(default = "default_memory_retention")]
    pub memory_retention: usize,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/telemetry.redb")
}

fn default_memory_retention() -> usize {
    50_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            memory_retention: default_memory_retention(),
        }
    }
}

/// Pick the config file: explicit path, then `GRIDMIND_CONFIG`, then the default.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var(env_vars::CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Parse a TOML document into `T`.
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Read and parse a TOML file.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(category = "config", path = %path.display(), "Loading configuration");
    parse_toml(&content)
}

/// Whether an env flag is set to a truthy value.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Reject values that are zero where a period is required.
pub fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

/// Reject values outside a closed interval.
pub fn require_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{} not in [{}, {}]", value, min, max),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sections {
        #[serde(default)]
        runtime: RuntimeConfig,
        #[serde(default)]
        logging: LoggingConfig,
        #[serde(default)]
        storage: StorageConfig,
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let s: Sections = parse_toml("").unwrap();
        assert_eq!(s.runtime, RuntimeConfig::default());
        assert_eq!(s.logging.level, "gridmind=info");
        assert_eq!(s.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_partial_sections() {
        let s: Sections = parse_toml(
            r#"
            [runtime]
            timezone_offset_minutes = 60

            [storage]
            backend = "redb"
            path = "/var/lib/gridmind/t.redb"
            "#,
        )
        .unwrap();
        assert_eq!(s.runtime.timezone_offset_minutes, 60);
        assert_eq!(s.runtime.event_capacity, 1000);
        assert_eq!(s.storage.backend, StorageBackend::Redb);
        assert_eq!(s.storage.memory_retention, 50_000);
    }

    #[test]
    fn test_load_from_file_and_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\njson = true").unwrap();
        let s: Sections = load_toml(file.path()).unwrap();
        assert!(s.logging.json);

        let missing = load_toml::<Sections>(Path::new("/nonexistent/gridmind.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let bad = parse_toml::<Sections>("[storage]\nbackend = \"floppy\"");
        assert!(matches!(bad, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validators() {
        assert!(require_positive("poller.interval_secs", 0).is_err());
        assert!(require_range("anomaly.x", 0.5, 0.0, 1.0).is_ok());
        let err: Error = require_range("t", f64::NAN, 0.0, 1.0).unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_explicit_path_wins() {
        let p = resolve_config_path(Some(Path::new("custom.toml")));
        assert_eq!(p, PathBuf::from("custom.toml"));
    }
}
