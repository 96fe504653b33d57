use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config contains no credentials")]
    NoCredentials,
}

/// One credential set. Every credential gets its own session with its own
/// instance registry; sessions never share state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub key: String,
    pub tenant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run duration in seconds.
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    /// Poll interval in seconds when an iteration made no progress.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Run one tokio task per session instead of running them sequentially.
    #[serde(default)]
    pub parallel: bool,
    /// Delete all existing servers before the run starts.
    #[serde(default)]
    pub wipe: bool,
    /// Fixed RNG seed for reproducible operation sequences.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration(),
            poll_interval_secs: default_poll_interval(),
            parallel: false,
            wipe: false,
            seed: None,
        }
    }
}

fn default_duration() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        if config.credentials.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        Ok(config)
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&dir.join(".vmstress.toml"))
    }
}
