use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::SqliteStorage;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Directory for the local store and log files
  /// (defaults to $XDG_DATA_HOME/tracksync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the REST data service
  pub url: String,
  #[serde(default = "default_connect_timeout")]
  pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
  10
}

/// Retry and scheduling knobs, in the units they are written in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed attempts tolerated before an entry is dropped
  pub max_retries: u32,
  /// Safety-net drain interval while online
  pub poll_interval_secs: u64,
  /// Upper bound for a single remote call
  pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let policy = SyncPolicy::default();
    Self {
      max_retries: policy.max_retries,
      poll_interval_secs: policy.poll_interval.as_secs(),
      request_timeout_secs: policy.request_timeout.as_secs(),
    }
  }
}

impl SyncConfig {
  pub fn policy(&self) -> SyncPolicy {
    SyncPolicy {
      max_retries: self.max_retries,
      poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
      request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
    }
  }
}

/// Retry and scheduling policy used by the sync worker and connectivity gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
  /// An entry is dropped once its retry count exceeds this
  pub max_retries: u32,
  pub poll_interval: Duration,
  pub request_timeout: Duration,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      poll_interval: Duration::from_secs(30),
      request_timeout: Duration::from_secs(15),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tracksync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tracksync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tracksync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tracksync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tracksync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Path of the SQLite store.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.join("store.db")),
      None => SqliteStorage::default_path(),
    }
  }

  /// Directory for log files, next to the store.
  pub fn log_dir(&self) -> Result<PathBuf> {
    let store = self.store_path()?;
    store
      .parent()
      .map(|p| p.join("logs"))
      .ok_or_else(|| eyre!("Store path {} has no parent", store.display()))
  }

  /// Get the API token for the remote service from the environment.
  ///
  /// Checks TRACKSYNC_API_TOKEN. Requests go out unauthenticated when unset.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TRACKSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
