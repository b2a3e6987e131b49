//! Configuration management for latchkey.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LatchkeyError, Result};

/// Environment variable prefix for overrides, e.g. `LATCHKEY__STORE__HOST`.
pub const ENV_PREFIX: &str = "LATCHKEY";

/// Main configuration, injected at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatchkeyConfig {
    /// Store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Lock behavior
    #[serde(default)]
    pub locks: LockSettings,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Which store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// Store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: default_host(),
            port: default_port(),
            password: None,
            db: 0,
        }
    }
}

impl StoreConfig {
    /// Redis connection URL for these settings.
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Connection URL safe to log: the password is masked.
    pub fn redacted_url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => {
                format!("redis://:***@{}:{}/{}", self.host, self.port, self.db)
            }
            _ => self.url(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

/// Lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// How long the manager keeps a handle past its lease, in milliseconds
    #[serde(default = "default_registry_grace")]
    pub registry_grace_ms: u64,

    /// Interval of the registry sweeper, in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Attempts made by the run-under-lock helper
    #[serde(default = "default_mutex_retries")]
    pub mutex_retries: u32,

    /// Delay between run-under-lock attempts, in milliseconds
    #[serde(default = "default_mutex_retry_delay")]
    pub mutex_retry_delay_ms: u64,

    /// Per-call timeout of background renewals, in milliseconds
    #[serde(default = "default_renew_timeout")]
    pub renew_timeout_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            registry_grace_ms: default_registry_grace(),
            sweep_interval_ms: default_sweep_interval(),
            mutex_retries: default_mutex_retries(),
            mutex_retry_delay_ms: default_mutex_retry_delay(),
            renew_timeout_ms: default_renew_timeout(),
        }
    }
}

impl LockSettings {
    pub fn registry_grace(&self) -> Duration {
        Duration::from_millis(self.registry_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn mutex_retry_delay(&self) -> Duration {
        Duration::from_millis(self.mutex_retry_delay_ms)
    }

    pub fn renew_timeout(&self) -> Duration {
        Duration::from_millis(self.renew_timeout_ms)
    }
}

fn default_registry_grace() -> u64 {
    10_000
}

fn default_sweep_interval() -> u64 {
    1_000
}

fn default_mutex_retries() -> u32 {
    3
}

fn default_mutex_retry_delay() -> u64 {
    100
}

fn default_renew_timeout() -> u64 {
    5_000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Prefix of every window key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Path to a rules file (see `ratelimit::LimitRules`)
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Timeout of the compensating removal, in milliseconds
    #[serde(default = "default_compensation_timeout")]
    pub compensation_timeout_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            rules_path: None,
            compensation_timeout_ms: default_compensation_timeout(),
        }
    }
}

impl RateLimitingConfig {
    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_millis(self.compensation_timeout_ms)
    }
}

pub(crate) fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_compensation_timeout() -> u64 {
    1_000
}

impl LatchkeyConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| LatchkeyError::Config(e.to_string()))
    }

    /// Layer an optional YAML file and `LATCHKEY__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LatchkeyError::Config(e.to_string()))
    }
}
