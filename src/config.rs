//! # Configuration Management Module
//!
//! Persistent application settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `device_name_filter`: substring the scale's advertised name must contain
//! - `scan_timeout_secs`: how long a scan runs before giving up
//! - `finalize_delay_secs`: grace period between stopping a shot and ending capture
//! - `rolling_window_secs`: span of the live mass trace
//! - `scan_on_startup`: start scanning as soon as the app launches
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/gravimetric/config.toml
//! - Linux: ~/.config/gravimetric/config.toml
//! - Windows: %APPDATA%\gravimetric\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_name_filter: String,
    pub scan_timeout_secs: u64,
    pub finalize_delay_secs: u64,
    pub rolling_window_secs: u64,
    pub scan_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name_filter: "LoggingScale".to_string(),
            scan_timeout_secs: 10,
            finalize_delay_secs: 5,
            rolling_window_secs: 60,
            scan_on_startup: true,
        }
    }
}

impl Config {
    /// Get the path to the config file
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gravimetric")
            .join("config.toml")
    }

    /// Load config from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, create default
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn finalize_delay(&self) -> Duration {
        Duration::from_secs(self.finalize_delay_secs)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_secs(self.rolling_window_secs)
    }
}
