//! Daemon configuration
//!
//! Loaded from a TOML file; every key is optional.
//!
//! ```toml
//! socket_path = "/tmp/bluemux.sock"
//! idle_power_off_secs = 10
//! log_level = "info"
//!
//! [dump]
//! enabled = true
//! path = "/tmp/hci_dump.pklg"
//!
//! [controller]
//! name = "bluemux"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::power::DEFAULT_IDLE_POWER_OFF;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/bluemux.sock";
pub const DEFAULT_DUMP_PATH: &str = "/tmp/hci_dump.pklg";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub idle_power_off_secs: u64,
    pub log_level: String,
    pub dump: DumpConfig,
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DumpConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ControllerConfig {
    pub name: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            idle_power_off_secs: DEFAULT_IDLE_POWER_OFF.as_secs(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            dump: DumpConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(DEFAULT_DUMP_PATH),
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_power_off_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
        assert!(!config.dump.enabled);
    }

    #[test]
    fn test_partial_config() {
        let config = DaemonConfig::from_toml(
            r#"
            idle_power_off_secs = 30

            [dump]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert!(config.dump.enabled);
        assert_eq!(config.dump.path, PathBuf::from(DEFAULT_DUMP_PATH));
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_invalid_config() {
        let err = DaemonConfig::from_toml("idle_power_off_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "socket_path = \"/run/bluemux.sock\"").unwrap();
        writeln!(file, "[controller]").unwrap();
        writeln!(file, "name = \"test controller\"").unwrap();

        let config = DaemonConfig::from_path(file.path()).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/bluemux.sock"));
        assert_eq!(config.controller.name.as_deref(), Some("test controller"));

        let missing = DaemonConfig::from_path("/nonexistent/bluemux.toml");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
