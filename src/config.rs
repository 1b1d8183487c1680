//! Configuration loader and validator for the offline cache and sync daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheGenerations;
use crate::sync::{RetryPolicy, SyncOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub api: Api,
    pub sync: SyncSettings,
    pub cache: CacheSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Address the local caching proxy binds to.
    pub listen: String,
}

/// Upstream memorial API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    pub health_path: String,
}

/// Queue draining settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub interval_seconds: u64,
    pub max_upload_attempts: u32,
    pub probe_interval_ms: u64,
    /// Bound on every upstream call made by the sync drain and the router.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout_seconds() -> u64 {
    crate::api::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

/// Cache generation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
    pub version: String,
    #[serde(default)]
    pub precache: Vec<String>,
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/offline.db", self.app.resolved_data_dir()))
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            interval: Duration::from_secs(self.sync.interval_seconds),
            retry: RetryPolicy {
                max_upload_attempts: self.sync.max_upload_attempts,
            },
            initially_online: true,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.sync.probe_interval_ms)
    }

    pub fn generations(&self) -> CacheGenerations {
        CacheGenerations::for_version(&self.cache.version)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.listen.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.listen must be a socket address"));
    }

    if reqwest::Url::parse(&cfg.api.base_url).is_err() {
        return Err(ConfigError::Invalid("api.base_url must be an absolute URL"));
    }
    if !cfg.api.health_path.starts_with('/') {
        return Err(ConfigError::Invalid("api.health_path must start with '/'"));
    }

    if cfg.sync.interval_seconds == 0 {
        return Err(ConfigError::Invalid("sync.interval_seconds must be > 0"));
    }
    if cfg.sync.max_upload_attempts == 0 {
        return Err(ConfigError::Invalid("sync.max_upload_attempts must be > 0"));
    }
    if cfg.sync.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("sync.request_timeout_seconds must be > 0"));
    }
    if cfg.sync.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("sync.probe_interval_ms must be > 0"));
    }

    if cfg.cache.version.trim().is_empty() {
        return Err(ConfigError::Invalid("cache.version must be non-empty"));
    }
    if cfg.cache.precache.iter().any(|p| !p.starts_with('/')) {
        return Err(ConfigError::Invalid("cache.precache entries must start with '/'"));
    }

    Ok(())
}

/// Returns the example YAML content shipped as `config.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen: "127.0.0.1:8787"

api:
  base_url: "http://localhost:3000/"
  health_path: "/api/health"

sync:
  interval_seconds: 30
  max_upload_attempts: 3
  probe_interval_ms: 5000
  request_timeout_seconds: 30

cache:
  version: "v1"
  precache:
    - "/"
    - "/manifest.json"
    - "/icons/icon-192.png"
    - "/icons/icon-512.png"
"#
}
