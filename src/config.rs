use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheSettings, RequestRules};
use crate::db::Database;
use crate::sync::{RetryPolicy, SyncOptions};

/// Environment variable holding the API token.
pub const TOKEN_ENV: &str = "FIELDSYNC_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the records API
  pub url: Url,
  /// Resource scopes this client pulls
  #[serde(default)]
  pub scopes: Vec<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Periodic drain interval; 0 disables the timer
  pub interval_secs: u64,
  pub max_attempts: u32,
  pub backoff_base_secs: u64,
  pub backoff_cap_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let retry = RetryPolicy::default();
    Self {
      interval_secs: 60,
      max_attempts: retry.max_attempts,
      backoff_base_secs: retry.base_delay.as_secs(),
      backoff_cap_secs: retry.max_delay.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// URL probed for reachability; defaults to the remote base URL
  pub probe_url: Option<Url>,
  pub probe_interval_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to pass every request straight to the network
  pub enabled: bool,
  pub namespace: String,
  /// Build version; partitions of any other version are deleted on start
  pub version: String,
  pub api_max_age_secs: u64,
  /// Independent of `api_max_age_secs`
  pub sweep_interval_secs: u64,
  pub api_prefixes: Vec<String>,
  pub shell_paths: Vec<String>,
  pub shell_prefixes: Vec<String>,
  pub shell_extensions: Vec<String>,
  pub fallback_path: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      namespace: "fieldsync".into(),
      version: env!("CARGO_PKG_VERSION").into(),
      api_max_age_secs: 24 * 60 * 60,
      sweep_interval_secs: 60 * 60,
      api_prefixes: vec!["/api/".into()],
      shell_paths: vec!["/".into(), "/index.html".into(), "/manifest.json".into()],
      shell_prefixes: vec!["/assets/".into(), "/static/".into()],
      shell_extensions: ["js", "css", "html", "svg", "png", "woff2", "ico"]
        .iter()
        .map(|e| e.to_string())
        .collect(),
      fallback_path: "/index.html".into(),
    }
  }
}

impl CacheConfig {
  pub fn settings(&self) -> CacheSettings {
    CacheSettings {
      namespace: self.namespace.clone(),
      version: self.version.clone(),
      api_max_age: Duration::from_secs(self.api_max_age_secs),
      sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
      rules: RequestRules::from(self),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file; defaults to the platform data directory
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    Ok(config)
  }

  /// Get the API token from the environment, if set.
  pub fn api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty())
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    self
      .storage
      .path
      .clone()
      .or_else(Database::default_path)
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.sync.max_attempts,
      base_delay: Duration::from_secs(self.sync.backoff_base_secs),
      max_delay: Duration::from_secs(self.sync.backoff_cap_secs),
    }
  }

  pub fn sync_options(&self) -> SyncOptions {
    SyncOptions {
      retry: self.retry_policy(),
      periodic: (self.sync.interval_secs > 0).then(|| Duration::from_secs(self.sync.interval_secs)),
      scopes: self.remote.scopes.clone(),
    }
  }

  pub fn probe_url(&self) -> Url {
    self
      .network
      .probe_url
      .clone()
      .unwrap_or_else(|| self.remote.url.clone())
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.network.probe_interval_secs.max(1))
  }
}
