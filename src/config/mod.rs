//! Application configuration.
//!
//! Aggregates configuration from all components into a single `AppConfig`
//! that can be loaded from YAML files or environment variables.

pub mod paths;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::bus::BusConfig;
use crate::listener::ListenerConfig;
#[cfg(feature = "sqlite")]
use crate::rollup::RollupConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "stationlink.yaml";
/// Environment variable for config file path.
pub const CONFIG_ENV_VAR: &str = "STATIONLINK_CONFIG";
/// Environment variable prefix for config overrides.
pub const CONFIG_ENV_PREFIX: &str = "STATIONLINK";
/// Environment variable for log level.
pub const LOG_ENV_VAR: &str = "STATIONLINK_LOG";

/// Application directory name under the platform data dir.
pub const APP_DIR_NAME: &str = "stationlink";
/// Override file name inside the application directory.
pub const SETTINGS_FILE_NAME: &str = "settings.yaml";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings repository configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Override file location. Defaults to the platform data dir.
    pub override_path: Option<PathBuf>,
}

impl SettingsConfig {
    /// Resolved override file path.
    ///
    /// Falls back to the working directory when the platform has no data dir.
    pub fn override_path(&self) -> PathBuf {
        if let Some(path) = &self.override_path {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
            .join(SETTINGS_FILE_NAME)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// UDP ingestion listener.
    pub listener: ListenerConfig,
    /// Relay bus.
    pub bus: BusConfig,
    /// Settings repository.
    pub settings: SettingsConfig,
    /// Rollup worker.
    #[cfg(feature = "sqlite")]
    pub rollup: RollupConfig,
}

impl AppConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `stationlink.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::from(config_path).format(FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.listener.bind_attempts == 0 {
            return invalid("listener.bind_attempts must be at least 1");
        }
        if self.listener.receive_timeout_ms == 0 {
            return invalid("listener.receive_timeout_ms must be positive");
        }
        if self.listener.error_threshold == 0 {
            return invalid("listener.error_threshold must be at least 1");
        }

        #[cfg(feature = "sqlite")]
        {
            if self.rollup.tick_interval_secs == 0 {
                return invalid("rollup.tick_interval_secs must be positive");
            }
            if self.rollup.max_buckets_per_tick == 0 {
                return invalid("rollup.max_buckets_per_tick must be at least 1");
            }
            if self.rollup.bucket_widths.is_empty() {
                return invalid("rollup.bucket_widths must not be empty");
            }
        }

        Ok(())
    }
}
