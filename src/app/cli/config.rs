//! TOML configuration file loading
//!
//! The file has three optional sections, `[queue]`, `[dispatcher]` and
//! `[logging]`; anything left out takes its default. Without an explicit
//! `--config-file` the default location is used when it exists.

use crate::core::logging::LoggingSettings;
use crate::queue::api::{DispatcherSettings, QueueError, QueueResult, QueueSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub queue: QueueSettings,
    pub dispatcher: DispatcherSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("The specified configuration file does not exist: {}", .path.display())]
    Missing { path: PathBuf },

    #[error("Error reading configuration file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error parsing configuration file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Error in configuration file validation {}: {source}", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: QueueError,
    },
}

/// `<config dir>/brokerqueue/brokerqueue.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("brokerqueue").join("brokerqueue.toml"))
}

impl BrokerConfig {
    /// Load `config_file`, or the default file if present, or defaults
    pub async fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match config_file {
            Some(path) => {
                // A file named on the command line must exist
                if !path.exists() {
                    return Err(ConfigError::Missing {
                        path: path.to_path_buf(),
                    });
                }
                path.to_path_buf()
            }
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        Self::from_toml(&contents, &path)
    }

    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        self.queue.validate()?;
        self.dispatcher.validate()
    }
}
