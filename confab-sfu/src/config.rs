//! SFU Configuration

use crate::track::QualityLayer;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms per manager (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum clients per room (0 = unlimited)
    pub max_clients_per_room: usize,
    /// Enable Simulcast (multiple quality layers)
    pub enable_simulcast: bool,
    /// Layer a new subscription starts on
    pub default_quality: QualityLayer,
    /// Close a room as soon as its last client leaves
    pub close_empty_rooms: bool,
    /// Idle packet buffers kept for reuse
    pub packet_pool_capacity: usize,
    /// Capacity of each client's forwarded packet channel
    pub client_packet_channel_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_clients_per_room: 50,
            enable_simulcast: true,
            default_quality: QualityLayer::Medium,
            close_empty_rooms: false,
            packet_pool_capacity: 1024,
            client_packet_channel_capacity: 256,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl SfuConfig {
    /// Load configuration from file and environment variables
    ///
    /// Priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_file, Self::environment())
    }

    /// `CONFAB_MAX_ROOMS` sets `max_rooms`; a double underscore descends into
    /// a section, so `CONFAB_LOGGING__LEVEL` sets `logging.level`.
    fn environment() -> Environment {
        Environment::with_prefix("CONFAB")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with_env(config_file: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_packet_channel_capacity == 0 {
            return Err(ConfigError::Message(
                "client_packet_channel_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
