use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::worker::{
  ActivateOptions, AssetManifest, CacheVersion, Deployment, Exclusions, InstallOptions,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Name of the cache store this deployment owns; bump it to roll over
  pub version: CacheVersion,
  /// Scope the cache serves; relative manifest entries resolve against it
  pub origin: Url,
  #[serde(default)]
  pub manifest: AssetManifest,
  #[serde(default)]
  pub exclusions: Exclusions,
  #[serde(default)]
  pub install: InstallOptions,
  #[serde(default)]
  pub activate: ActivateOptions,
  /// Page served to navigations when the network is down
  pub offline_fallback: Option<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database file (defaults to the user data directory, ":memory:" keeps it in RAM)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  /// Whole-request timeout in seconds
  pub timeout: u64,
  pub connect_timeout: u64,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout: 30,
      connect_timeout: 10,
      user_agent: concat!("shellcache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive, e.g. "info" or "shellcache=debug"
  pub level: String,
  /// Write daily-rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

const LOCAL_CONFIG: &str = "shellcache.yaml";

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (an error when it does not exist)
  /// 2. ./shellcache.yaml (current directory)
  /// 3. shellcache/config.yaml under the platform config directory (`dirs::config_dir`, e.g.
  ///    $XDG_CONFIG_HOME on Linux)
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    let searched = Self::search_paths();
    match searched.iter().find(|p| p.exists()) {
      Some(path) => Self::load_from_path(path),
      None => Err(eyre!(
        "No configuration file found, looked in: {}",
        searched
          .iter()
          .map(|p| p.display().to_string())
          .collect::<Vec<_>>()
          .join(", ")
      )),
    }
  }

  /// Implicit config locations, most specific first.
  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("shellcache").join("config.yaml"));
    }
    paths
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host_str().is_none() {
      return Err(eyre!("Origin must be an http(s) URL, got {}", self.origin));
    }

    self.manifest.resolve(&self.origin)?;

    if self.exclusions.hosts.iter().any(|h| h.trim().is_empty()) {
      return Err(eyre!("exclusions.hosts must not contain blank patterns"));
    }

    if let Some(fallback) = &self.offline_fallback {
      crate::worker::manifest::resolve_entry(&self.origin, fallback)
        .map_err(|e| eyre!("Invalid offline_fallback: {}", e))?;
    }

    if self.http.timeout == 0 {
      return Err(eyre!("http.timeout must be at least one second"));
    }

    crate::logging::filter(&self.logging)?;

    Ok(())
  }

  /// The deployment this configuration describes.
  pub fn deployment(&self) -> Deployment {
    Deployment {
      version: self.version.clone(),
      manifest: self.manifest.clone(),
      exclusions: self.exclusions.clone(),
      offline_fallback: self.offline_fallback.clone(),
      install: self.install.clone(),
      activate: self.activate.clone(),
    }
  }
}
