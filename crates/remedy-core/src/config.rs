//! Engine configuration
//!
//! Loaded from TOML, then optionally overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `REMEDY_AUTO_REMEDIATION_ENABLED` | `auto_remediation_enabled` |
//! | `REMEDY_STORE_PATH` | `store.path` |
//! | `REMEDY_MONITOR_POLL_INTERVAL` | `monitor.poll_interval` |
//! | `REMEDY_MONITOR_MAX_DURATION` | `monitor.max_duration` |
//!
//! Every delay (poll interval, monitor ceiling, policy backoff) is expressed
//! in `time_unit`, which defaults to seconds.

use crate::error::ConfigError;
use crate::monitor::MonitorSettings;
use crate::policy::{RetryPolicy, RetryPolicyTable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_AUTO_REMEDIATION: &str = "REMEDY_AUTO_REMEDIATION_ENABLED";
pub const ENV_STORE_PATH: &str = "REMEDY_STORE_PATH";
pub const ENV_POLL_INTERVAL: &str = "REMEDY_MONITOR_POLL_INTERVAL";
pub const ENV_MAX_DURATION: &str = "REMEDY_MONITOR_MAX_DURATION";

/// Unit applied to every configured delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Seconds,
    /// Used by simulations to run real schedules a thousand times faster
    Milliseconds,
}

impl TimeUnit {
    #[inline]
    #[must_use]
    pub fn unit(self) -> Duration {
        match self {
            TimeUnit::Seconds => Duration::from_secs(1),
            TimeUnit::Milliseconds => Duration::from_millis(1),
        }
    }

    #[inline]
    #[must_use]
    pub fn scale(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Milliseconds => Duration::from_millis(amount),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemedyConfig {
    /// Kill switch; when off every new incident escalates immediately
    pub auto_remediation_enabled: bool,
    pub time_unit: TimeUnit,
    pub monitor: MonitorConfig,
    pub store: StoreConfig,
    pub notifier: NotifierConfig,
    /// Empty means the built-in table
    pub policies: Vec<PolicyConfig>,
}

impl RemedyConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply `REMEDY_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment, CLI flags)
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_AUTO_REMEDIATION) {
            self.auto_remediation_enabled = parse_bool(&value).ok_or(ConfigError::Invalid {
                field: "auto_remediation_enabled",
                message: format!("expected a boolean, got {value:?}"),
            })?;
        }
        if let Some(value) = lookup(ENV_STORE_PATH) {
            self.store.path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL) {
            self.monitor.poll_interval = parse_u64("monitor.poll_interval", &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_DURATION) {
            self.monitor.max_duration = parse_u64("monitor.max_duration", &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    #[inline]
    #[must_use]
    pub fn with_auto_remediation(mut self, enabled: bool) -> Self {
        self.auto_remediation_enabled = enabled;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_time_unit(mut self, unit: TimeUnit) -> Self {
        self.time_unit = unit;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_monitor(mut self, poll_interval: u64, max_duration: u64) -> Self {
        self.monitor = MonitorConfig {
            poll_interval,
            max_duration,
        };
        self
    }

    #[inline]
    #[must_use]
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = Some(path.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_store_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.store.retry_attempts = attempts;
        self.store.retry_backoff_ms = backoff_ms;
        self
    }

    /// Check value ranges and that the policy table builds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.poll_interval",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.monitor.max_duration == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.max_duration",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.notifier.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "notifier.channel_capacity",
                message: "must be greater than zero".to_string(),
            });
        }
        self.policy_table().map(|_| ())
    }

    /// Effective retry policy table, with delays in `time_unit`
    pub fn policy_table(&self) -> Result<RetryPolicyTable, ConfigError> {
        if self.policies.is_empty() {
            return Ok(RetryPolicyTable::builtin().scaled(self.time_unit.unit()));
        }
        let policies = self
            .policies
            .iter()
            .map(|p| p.build(self.time_unit))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RetryPolicyTable::new(policies)?)
    }

    #[must_use]
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: self.time_unit.scale(self.monitor.poll_interval),
            max_duration: self.time_unit.scale(self.monitor.max_duration),
        }
    }

    /// Delay between store retries (always milliseconds)
    #[must_use]
    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store.retry_backoff_ms)
    }
}

impl Default for RemedyConfig {
    fn default() -> Self {
        Self {
            auto_remediation_enabled: true,
            time_unit: TimeUnit::Seconds,
            monitor: MonitorConfig::default(),
            store: StoreConfig::default(),
            notifier: NotifierConfig::default(),
            policies: Vec::new(),
        }
    }
}

/// Monitor cadence, in `time_unit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval: u64,
    pub max_duration: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: 30,
            max_duration: 3600,
        }
    }
}

/// Store access settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retries after the first failed call before the engine halts
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Snapshot file; in-memory store when absent
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 500,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub channel_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// One `[[policies]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub category: String,
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Vec<u64>,
    #[serde(default)]
    pub action: Option<String>,
}

impl PolicyConfig {
    #[must_use]
    pub fn new(category: impl Into<String>, max_attempts: u32, backoff: Vec<u64>) -> Self {
        Self {
            category: category.into(),
            max_attempts,
            backoff,
            action: None,
        }
    }

    fn build(&self, unit: TimeUnit) -> Result<RetryPolicy, ConfigError> {
        let backoff = self.backoff.iter().map(|n| unit.scale(*n)).collect();
        let policy = RetryPolicy::new(self.category.clone(), self.max_attempts, backoff)?;
        Ok(match &self.action {
            Some(action) => policy.with_action(action.clone()),
            None => policy,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field,
        message: format!("expected an integer, got {value:?}"),
    })
}
