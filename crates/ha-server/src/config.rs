//! configuration.yaml
//!
//! ```yaml
//! homeassistant:
//!   name: Home
//! logger:
//!   default: info
//! demo:
//!   - name: Office printer
//!     scan_interval: 30
//!     fail_every: 5
//!     sensors: [toner, pages]
//!   - name: Garden station
//!     sensors: [temperature, humidity]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// The parsed configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub homeassistant: CoreConfig,

    #[serde(default)]
    pub logger: LoggerConfig,

    /// Simulated devices set up by the demo integration
    #[serde(default)]
    pub demo: Vec<DemoDeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    /// Log level or filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub default: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
        }
    }
}

/// One simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoDeviceConfig {
    pub name: String,

    /// Poll every this many seconds; absent means the device pushes updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_interval: Option<u64>,

    /// Every n-th fetch fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_every: Option<u32>,

    #[serde(default = "default_sensors")]
    pub sensors: Vec<String>,
}

fn default_name() -> String {
    "Home".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sensors() -> Vec<String> {
    vec!["temperature".to_string()]
}

impl Configuration {
    /// Load and validate a configuration file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate configuration text read from `source_path`
    pub fn parse(content: &str, source_path: &Path) -> ConfigResult<Self> {
        // An empty file parses as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for (index, device) in self.demo.iter().enumerate() {
            let key = |field: &str| format!("demo[{index}].{field}");

            if device.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key("name"),
                    reason: "must not be empty".to_string(),
                });
            }
            if !names.insert(device.name.to_lowercase()) {
                return Err(ConfigError::InvalidValue {
                    key: key("name"),
                    reason: format!("duplicate device '{}'", device.name),
                });
            }
            if device.scan_interval == Some(0) {
                return Err(ConfigError::InvalidValue {
                    key: key("scan_interval"),
                    reason: "must be at least 1 second".to_string(),
                });
            }
            if device.fail_every == Some(0) {
                return Err(ConfigError::InvalidValue {
                    key: key("fail_every"),
                    reason: "must be at least 1".to_string(),
                });
            }
            if device.sensors.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key("sensors"),
                    reason: "at least one sensor is required".to_string(),
                });
            }
        }
        Ok(())
    }
}
