//! Configuration file parsing and structures.
//!
//! lumend reads a single TOML file. Every table is optional, so an empty file
//! gives a daemon listening on `0.0.0.0:5006` with its documents in
//! `./data`. Runtime documents (registry, groups, scenes, state) are not
//! configuration; they live in the document store under `system.data_dir`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fixtures: FixturesConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub presence: PresenceProbeConfig,
    #[serde(default)]
    pub routines: RoutinesConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"lumend::fixture" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

/// System-wide configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Directory holding the JSON documents
    pub data_dir: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0".to_string(),
            port: 5006,
        }
    }
}

/// Fixture connection settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FixturesConfig {
    /// TCP control port of every fixture
    pub port: u16,

    /// Upper bound on one command, connect included
    pub command_timeout_ms: u64,

    /// Fade applied by the fixture to each change
    pub transition_ms: u64,
}

impl Default for FixturesConfig {
    fn default() -> Self {
        Self {
            port: crate::fixture::yeelight::DEFAULT_PORT,
            command_timeout_ms: 2000,
            transition_ms: 300,
        }
    }
}

impl FixturesConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn transition(&self) -> Duration {
        Duration::from_millis(self.transition_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long to collect search replies
    pub timeout_ms: u64,

    /// Rescan the network before serving
    pub scan_on_start: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            scan_on_start: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Probe settings. The automation itself is configured at runtime through
/// the API and stored with the other documents.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PresenceProbeConfig {
    pub probe_timeout_ms: u64,
}

impl Default for PresenceProbeConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 1500,
        }
    }
}

impl PresenceProbeConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RoutinesConfig {
    /// Pause between routine steps
    pub step_interval_ms: u64,
}

impl Default for RoutinesConfig {
    fn default() -> Self {
        Self {
            step_interval_ms: 1000,
        }
    }
}

impl RoutinesConfig {
    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}
