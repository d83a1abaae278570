//! Daemon configuration file
//!
//! ```toml
//! [usb]
//! backend = "serial"
//! chip_priority = ["CH34", "FTDI", "CP210", "PL2303"]
//!
//! [bluetooth]
//! device_name = "HC-05"
//!
//! [session]
//! batch_capacity = 1110
//!
//! [processing]
//! program = "python3"
//! args = ["process_single_sensor.py"]
//!
//! [persistence]
//! path = "tetires-results.jsonl"
//! ```
//!
//! Every table is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tetires_link::{LinkConfig, LinkConfigError};
use tetires_session::{SessionConfig, SessionConfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Link(#[from] LinkConfigError),

    #[error("Invalid config: {0}")]
    Session(#[from] SessionConfigError),

    #[error("Invalid config: processing.timeout_ms must be greater than zero")]
    ZeroProcessingTimeout,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TetiresConfig {
    /// `[usb]`, `[bluetooth]`, `[reconnect]`, `[hotplug]`, `[framing]`
    #[serde(flatten)]
    pub link: LinkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl TetiresConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        self.session.validate()?;
        if self.processing.timeout_ms == 0 {
            return Err(ConfigError::ZeroProcessingTimeout);
        }
        Ok(())
    }
}

// =============================================================================
// Processing
// =============================================================================

/// External program that turns one batch into a measurement
///
/// Samples are written to its stdin one per line; it answers with a JSON
/// envelope on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_processing_timeout")]
    pub timeout_ms: u64,
}

fn default_processing_timeout() -> u64 {
    30_000
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            timeout_ms: default_processing_timeout(),
        }
    }
}

impl ProcessingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON-lines file results are appended to
    #[serde(default = "default_results_path")]
    pub path: PathBuf,
}

fn default_results_path() -> PathBuf {
    PathBuf::from("tetires-results.jsonl")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_results_path(),
        }
    }
}
