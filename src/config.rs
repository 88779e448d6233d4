use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Directory holding the cache database, the legacy flat store and logs
  /// (defaults to $XDG_DATA_HOME/posync)
  pub data_dir: Option<PathBuf>,
  pub backend: BackendConfig,
  pub cache: CacheConfig,
  pub store: StoreConfig,
  pub worker: WorkerConfig,
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL of the backend, e.g. https://erp.example.com
  pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Hard ceiling for each offline queue
  pub max_queue_items: usize,
  /// Rows per storage transaction during bulk ingestion
  pub bulk_chunk_size: usize,
  /// How long cached price list rates stay valid
  pub price_ttl_secs: u64,
  /// How long cached item details stay valid
  pub item_details_ttl_secs: u64,
  /// Assumed storage ceiling used for the usage percentage
  pub usage_ceiling_bytes: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_queue_items: crate::MAX_QUEUE_ITEMS,
      bulk_chunk_size: 1000,
      price_ttl_secs: 24 * 60 * 60,
      item_details_ttl_secs: 15 * 60,
      usage_ceiling_bytes: 50 * 1024 * 1024,
    }
  }
}

impl CacheConfig {
  pub fn price_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.price_ttl_secs as i64)
  }

  pub fn item_details_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.item_details_ttl_secs as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Attempts made to open the database before it is marked unavailable
  pub open_retries: u32,
  /// Extra health probes before the store is marked unavailable
  pub health_retries: u32,
  /// Initial backoff between attempts, doubled on each retry
  pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      open_retries: 3,
      health_retries: 3,
      retry_backoff_ms: 100,
    }
  }
}

impl StoreConfig {
  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Commit retries before a write is dropped
  pub commit_retries: u32,
  /// Initial backoff between commit retries, doubled on each retry
  pub retry_backoff_ms: u64,
  /// Channel capacity beyond one message per slot (flush requests)
  pub channel_headroom: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      commit_retries: 3,
      retry_backoff_ms: 50,
      channel_headroom: 16,
    }
  }
}

impl WorkerConfig {
  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
  /// Keep replaying later entries after one fails
  #[default]
  Continue,
  /// Stop the queue's pass at the first failure
  Stop,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub policy: SyncPolicy,
  /// Timeout for a single replayed backend call
  pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      policy: SyncPolicy::Continue,
      request_timeout_secs: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./posync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/posync/config.yaml
  ///
  /// Without any file the defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("posync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("posync").join("config.yaml");
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

  /// Resolve the data directory, falling back to the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("posync"))
  }

  /// Get the backend API credentials from environment variables.
  ///
  /// Reads POSYNC_API_KEY and POSYNC_API_SECRET; both must be set.
  pub fn get_api_credentials() -> Option<(String, String)> {
    let key = std::env::var("POSYNC_API_KEY").ok()?;
    let secret = std::env::var("POSYNC_API_SECRET").ok()?;
    Some((key, secret))
  }
}
