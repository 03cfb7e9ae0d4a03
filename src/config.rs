//! Engine Configuration
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! default_step_timeout: 30s
//! poll_interval: 5s
//! default_max_concurrent: 50
//! history_limit: 500
//! archive_dir: /var/lib/callflow/runs
//! retry:
//!   max_attempts: 2
//! compliance:
//!   weekday: "08:00-22:00"
//!   weekend: "09:00-20:00"
//! connections:
//!   postgres_main:
//!     url: postgres://callflow@localhost/debtors
//!     max_connections: 10
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::compliance::ComplianceWindow;
use crate::duration::serde_str;
use crate::error::ConfigError;
use crate::execution::retry::RetryPolicy;

/// Environment variable naming a config file when none is given explicitly.
pub const CONFIG_ENV: &str = "CALLFLOW_CONFIG";

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_concurrent() -> usize {
    50
}

fn default_history_limit() -> usize {
    500
}

fn default_http_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

/// A named database connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// e.g. `postgres://user@host/db` or `sqlite://calls.db`
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout", with = "serde_str")]
    pub acquire_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Applied to steps without their own timeout
    #[serde(default = "default_step_timeout", with = "serde_str")]
    pub default_step_timeout: Duration,

    /// How often `wait_for` re-evaluates its condition
    #[serde(default = "default_poll_interval", with = "serde_str")]
    pub poll_interval: Duration,

    /// Applied to pipelines without their own `max_concurrent`
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,

    /// Runs retained per pipeline in the registry
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Applied to pipelines without their own retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub compliance: ComplianceWindow,

    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Where terminal runs are written; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,

    #[serde(default = "default_http_connect_timeout", with = "serde_str")]
    pub http_connect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: default_step_timeout(),
            poll_interval: default_poll_interval(),
            default_max_concurrent: default_max_concurrent(),
            history_limit: default_history_limit(),
            retry: RetryPolicy::default(),
            compliance: ComplianceWindow::default(),
            connections: BTreeMap::new(),
            archive_dir: None,
            http_connect_timeout: default_http_connect_timeout(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a config from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as null.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading engine config from: {}", path.display());
        let yaml = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = Self::from_yaml(&yaml)?;
        debug!(
            "Engine config: {} connections, default timeout {:?}",
            config.connections.len(),
            config.default_step_timeout
        );
        Ok(config)
    }

    /// Loads the file named by `CALLFLOW_CONFIG`, or the defaults if unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    pub fn with_connection(mut self, name: impl Into<String>, connection: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), connection);
        self
    }

    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &str, value: Duration| {
            if value.is_zero() {
                Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "must be greater than zero".to_string(),
                })
            } else {
                Ok(())
            }
        };
        positive("default_step_timeout", self.default_step_timeout)?;
        positive("poll_interval", self.poll_interval)?;

        if self.default_max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for (name, connection) in &self.connections {
            if connection.max_connections == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("connections.{}.max_connections", name),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}
