use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sources::account::Account;
use crate::store::atomic_write;
use crate::sync::gtasks::GTASKS_URL;

pub const APP_NAME: &str = "wick";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("could not write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join(APP_NAME)
}

/// `<config_dir>/wick/config.json`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join(APP_NAME)
        .join("config.json")
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct WickConfig {
    /// Where each source's document is written.
    pub data_directory: PathBuf,
    pub save_delay_secs: u64,
    pub sync_interval_secs: u64,
    pub debug_logging: bool,
    pub local_source_name: String,
    pub api_base_url: String,
    pub accounts: Vec<Account>,
}

impl Default for WickConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_dir(),
            save_delay_secs: 5,
            sync_interval_secs: 300,
            debug_logging: false,
            local_source_name: "On This Computer".to_string(),
            api_base_url: GTASKS_URL.to_string(),
            accounts: Vec::new(),
        }
    }
}

impl WickConfig {
    pub fn save_delay(&self) -> Duration {
        Duration::from_secs(self.save_delay_secs)
    }

    /// Never shorter than ten seconds.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(10))
    }

    /// Load from the default location. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source: io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        atomic_write(path, json.as_bytes()).map_err(write_err)
    }
}
