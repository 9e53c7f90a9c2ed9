//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a working setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checker::AnomalyKind;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which adapter backs the engine
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database file (ignored for the memory backend)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// How long an assignment may sit `in_progress` without completing
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

impl CheckerConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Retries for transient store errors, per write and per snapshot read
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff, doubled on every retry
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Anomalies repaired concurrently within a pass
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Plan and audit repairs without writing
    #[serde(default)]
    pub dry_run: bool,

    /// Kinds left without a policy; their anomalies are reported unrepairable
    #[serde(default)]
    pub disabled_kinds: Vec<AnomalyKind>,

    /// Entries kept in the in-memory audit log
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            max_concurrency: default_max_concurrency(),
            dry_run: false,
            disabled_kinds: Vec::new(),
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl RepairConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run passes periodically in daemon mode
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between passes
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            http_port: default_http_port(),
        }
    }
}

// Defaults
fn default_store_path() -> PathBuf { PathBuf::from("data/assignments.db") }
fn default_stale_after() -> u64 { 4 * 60 * 60 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 200 }
fn default_max_concurrency() -> usize { 8 }
fn default_audit_capacity() -> usize { 1000 }
fn default_interval() -> u64 { 300 }
fn default_true() -> bool { true }
fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_http_port() -> u16 { 8090 }

impl Config {
    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checker.stale_after_secs == 0 {
            return Err(ConfigError::Invalid(
                "checker.stale_after_secs must be positive".to_string(),
            ));
        }
        if self.repair.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "repair.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.repair.audit_capacity == 0 {
            return Err(ConfigError::Invalid(
                "repair.audit_capacity must be at least 1".to_string(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.checker.stale_after_secs, 14_400);
        assert_eq!(config.repair.max_retries, 3);
        assert_eq!(config.repair.retry_backoff(), Duration::from_millis(200));
        assert!(config.repair.disabled_kinds.is_empty());
        assert_eq!(config.api.http_port, 8090);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
            [store]
            backend = "memory"

            [repair]
            dry_run = true
            disabled_kinds = ["stale_active_assignment"]
            "#,
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.repair.dry_run);
        assert_eq!(config.repair.disabled_kinds, vec![AnomalyKind::StaleActiveAssignment]);
        assert_eq!(config.repair.max_concurrency, 8);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Config::from_toml_str("[repair]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_kind_is_parse_error() {
        let err = Config::from_toml_str("[repair]\ndisabled_kinds = [\"bogus\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
