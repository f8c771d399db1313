//! Process settings.
//!
//! Sources in priority order:
//! 1. Environment variables (`MQTTGATE_*`)
//! 2. TOML file (`mqttgate.toml` unless another path is given)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Default settings file name.
pub const DEFAULT_SETTINGS_FILE: &str = "mqttgate.toml";

/// Environment variable names.
pub mod env_vars {
    pub const DATA_DIR: &str = "MQTTGATE_DATA_DIR";
    pub const LOG_JSON: &str = "MQTTGATE_LOG_JSON";
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_config_db() -> String {
    "config.redb".to_string()
}
fn default_data_db() -> String {
    "data.redb".to_string()
}
fn default_control_socket() -> String {
    "mqttgate.sock".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySettings {
    /// Directory holding the redb files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Instance configuration database file name
    #[serde(default = "default_config_db")]
    pub config_db: String,

    /// Schema, document and metadata database file name
    #[serde(default = "default_data_db")]
    pub data_db: String,

    /// Administration socket file name, created by `serve`
    #[serde(default = "default_control_socket")]
    pub control_socket: String,

    #[serde(default)]
    pub log_json: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            config_db: default_config_db(),
            data_db: default_data_db(),
            control_socket: default_control_socket(),
            log_json: false,
        }
    }
}

impl GatewaySettings {
    /// Load from `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => {
                info!(category = "config", "Loading settings from: {}", path.display());
                Self::from_toml(&content)?
            }
            Err(_) => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::InvalidConfig(format!("settings file: {}", e)))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(env_vars::DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = std::env::var(env_vars::LOG_JSON)
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.log_json = flag;
        }
    }

    pub fn config_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.config_db)
    }

    pub fn data_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.data_db)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.data_dir.join(&self.control_socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.config_db_path(), PathBuf::from("data/config.redb"));
        assert_eq!(settings.data_db_path(), PathBuf::from("data/data.redb"));
        assert_eq!(settings.control_socket_path(), PathBuf::from("data/mqttgate.sock"));
        assert!(!settings.log_json);
    }

    #[test]
    fn test_partial_toml() {
        let settings = GatewaySettings::from_toml("data_dir = \"/var/lib/mqttgate\"\n").unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/var/lib/mqttgate"));
        assert_eq!(settings.data_db, "data.redb");
    }

    #[test]
    fn test_bad_toml() {
        let err = GatewaySettings::from_toml("data_dir = [").unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }
}
