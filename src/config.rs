use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::model::{Scenario, Strategy};

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Decision service configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Auto-run pacing and strategy
    #[serde(default)]
    pub auto_run: AutoRunConfig,

    /// Local profile storage for session snapshots
    #[serde(default)]
    pub storage: StorageConfig,

    /// Scenario used for new sessions when none is given
    #[serde(default)]
    pub default_scenario: Scenario,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRunConfig {
    /// Pause between auto-run decisions, measured from the end of one round trip
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_delay_ms() -> u64 {
    200
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".berghain")
}

fn default_snapshot_key() -> String {
    "session_snapshot".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for AutoRunConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            strategy: Strategy::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            snapshot_key: default_snapshot_key(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AutoRunConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        info!(
            base_url = %config.api.base_url,
            delay_ms = config.auto_run.delay_ms,
            strategy = %config.auto_run.strategy,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("BERGHAIN_API_BASE_URL") {
            self.api.base_url = url;
        }
    }
}
