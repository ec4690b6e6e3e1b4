//! Daemon configuration
//!
//! Read from a TOML file; every field has a default so a missing file or a
//! partial one is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::script::ScriptSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    Read(String, String),

    #[error("Failed to parse {0}: {1}")]
    Parse(String, String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("/dev/input")
}

fn default_device_prefix() -> String {
    "event".to_string()
}

fn default_delay_ms() -> u64 {
    10
}

fn default_output_name() -> String {
    "joyprog virtual output".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory watched for device files
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// Only files whose name starts with this are candidates
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,

    /// Suspension time of `delay()` without an argument
    #[serde(default = "default_delay_ms")]
    pub default_delay_ms: u64,

    /// Compiled program loaded on every device
    #[serde(default)]
    pub profile: Option<PathBuf>,

    /// Name of the virtual output device
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            device_prefix: default_device_prefix(),
            default_delay_ms: default_delay_ms(),
            profile: None,
            output_name: default_output_name(),
        }
    }
}

impl DaemonConfig {
    /// `~/.config/joyprog/daemon.toml` or the platform equivalent
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("joyprog")
            .join("daemon.toml")
    }

    /// Loads the file at `path`, or the defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        let config = Self::parse(&content)
            .map_err(|e| ConfigError::Parse(path.display().to_string(), e.to_string()))?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_delay_ms must be at least 1".into(),
            ));
        }
        if self.device_prefix.is_empty() {
            return Err(ConfigError::Invalid("device_prefix must not be empty".into()));
        }
        Ok(())
    }

    pub fn script_settings(&self) -> ScriptSettings {
        ScriptSettings {
            delay_unit: Duration::from_millis(self.default_delay_ms),
        }
    }

    /// Reads the configured profile, if any
    pub fn read_profile(&self) -> Result<Option<String>, ConfigError> {
        match &self.profile {
            Some(path) => std::fs::read_to_string(path)
                .map(Some)
                .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string())),
            None => Ok(None),
        }
    }
}
