//! Client configuration.
//!
//! Layers, lowest to highest: built-in defaults, the TOML file, then
//! `KINDRED__SECTION__KEY` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::RetryPolicy;

pub const APP_NAME: &str = "kindred";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "KINDRED";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to expand path {path}: {message}")]
    Expand { path: String, message: String },

    #[error("unable to determine {0} directory")]
    NoDirectory(&'static str),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub history: HistoryConfig,
    pub credentials: CredentialsConfig,
    pub logging: LoggingConfig,
}

/// Backend endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// REST base URL, without trailing slash.
    pub base_url: String,
    /// WebSocket base; the conversation id is appended.
    pub ws_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            ws_url: "ws://localhost:8000/ws/chat".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Chat history retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            retry_delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

impl HistoryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Credential file. Defaults to `credentials.json` in the data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load from `path` (optional) and `KINDRED__*` variables.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: &Path, env_prefix: &str) -> ConfigResult<Self> {
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs.max(1))
    }

    /// Resolved credential file path.
    pub fn credentials_path(&self) -> ConfigResult<PathBuf> {
        match &self.credentials.file {
            Some(file) => expand_str_path(file),
            None => Ok(default_data_dir()?.join("credentials.json")),
        }
    }
}

/// Write the default configuration with a short header.
pub fn write_default_config(path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let toml = toml::to_string_pretty(&ClientConfig::default())?;
    let mut body = format!("# Configuration for {}\n# File: {}\n\n", APP_NAME, path.display());
    body.push_str(&toml);
    fs::write(path, body).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn expand_str_path(text: &str) -> ConfigResult<PathBuf> {
    let expanded = shellexpand::full(text).map_err(|e| ConfigError::Expand {
        path: text.to_string(),
        message: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> ConfigResult<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or(ConfigError::NoDirectory("configuration"))
}

pub fn default_data_dir() -> ConfigResult<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or(ConfigError::NoDirectory("data"))
}
