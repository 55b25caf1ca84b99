use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::access::{default_families, CourseFamily, FamilyTable};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the lab platform service
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token for the platform service, unauthenticated when absent
    pub token: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8200".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Interval between template VM status polls in seconds (default: 4)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Fixed prefix for published snapshot names
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
    /// Maximum length of the caller-supplied snapshot name fragment
    #[serde(default = "default_fragment_max_len")]
    pub fragment_max_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            snapshot_prefix: default_snapshot_prefix(),
            fragment_max_len: default_fragment_max_len(),
        }
    }
}

fn default_poll_interval() -> u64 {
    4
}

fn default_snapshot_prefix() -> String {
    "labdesk".to_string()
}

fn default_fragment_max_len() -> usize {
    40
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    /// Expiry offered to new labs when the caller sets none (default: 120)
    #[serde(default = "default_expiry_minutes")]
    pub default_expiry_minutes: i64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_expiry_minutes: default_expiry_minutes(),
        }
    }
}

fn default_expiry_minutes() -> i64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Course families and their sections
    #[serde(default = "default_families")]
    pub families: Vec<CourseFamily>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            families: default_families(),
        }
    }
}

impl AccessConfig {
    pub fn family_table(&self) -> FamilyTable {
        FamilyTable::new(self.families.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            session: SessionConfig::default(),
            workflow: WorkflowConfig::default(),
            access: AccessConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
