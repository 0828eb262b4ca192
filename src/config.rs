use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{
  FreshnessPolicy, LogCapacity, DEFAULT_OVERFLOW, DEFAULT_POLL_WINDOW_MS, DEFAULT_SOFT_CAP,
  DEFAULT_TTL_HOURS,
};

const APP_DIR: &str = "shigure-cache";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// API root, e.g. https://cafe.example.org/api/v1
  pub base_url: String,
}

/// Tunables for the cache tiers.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
  /// Database file (defaults to the user data directory)
  pub database: Option<PathBuf>,
  pub avatar_ttl_hours: i64,
  pub chat_soft_cap: usize,
  pub chat_overflow: usize,
  pub update_poll_window_ms: u64,
  /// When false nothing is written to disk
  pub persist: bool,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      database: None,
      avatar_ttl_hours: DEFAULT_TTL_HOURS,
      chat_soft_cap: DEFAULT_SOFT_CAP,
      chat_overflow: DEFAULT_OVERFLOW,
      update_poll_window_ms: DEFAULT_POLL_WINDOW_MS,
      persist: true,
    }
  }
}

impl CacheSettings {
  pub fn avatar_policy(&self) -> FreshnessPolicy {
    FreshnessPolicy::new(chrono::Duration::hours(self.avatar_ttl_hours))
  }

  pub fn chat_capacity(&self) -> LogCapacity {
    LogCapacity {
      soft_cap: self.chat_soft_cap,
      overflow: self.chat_overflow,
    }
  }

  pub fn poll_window(&self) -> Duration {
    Duration::from_millis(self.update_poll_window_ms)
  }

  /// Configured database path, or `<data_dir>/shigure-cache/cache.db`.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    data_dir().map(|dir| dir.join("cache.db"))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
  /// Also write a daily rolling log file in the data directory
  #[serde(default)]
  pub file: bool,
}

/// Per-user data directory of the application.
pub fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join(APP_DIR))
    .ok_or_else(|| eyre!("Could not determine the user data directory"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shigure-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shigure-cache/config.yaml
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
        "No configuration file found. Create one at ~/.config/shigure-cache/config.yaml\n\
         or pass --base-url."
      )),
    }
  }

  /// Like `load`, but a missing file is fine when the server URL is given
  /// on the command line.
  pub fn load_or_default(explicit_path: Option<&Path>, base_url: Option<&str>) -> Result<Self> {
    match (explicit_path, base_url, Self::find_config_file()) {
      (None, Some(url), None) => Ok(Self::with_base_url(url)),
      _ => {
        let config = Self::load(explicit_path)?;
        Ok(match base_url {
          Some(url) => Config {
            server: ServerConfig {
              base_url: url.to_string(),
            },
            ..config
          },
          None => config,
        })
      }
    }
  }

  pub fn with_base_url(base_url: &str) -> Self {
    Self {
      server: ServerConfig {
        base_url: base_url.to_string(),
      },
      cache: CacheSettings::default(),
      logging: LoggingConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shigure-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the API token from the environment, if any.
  ///
  /// Checks SHIGURE_API_TOKEN. Anonymous access is allowed.
  pub fn get_api_token() -> Option<String> {
    std::env::var("SHIGURE_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}
