//! Configuration management for the Cadence engine.
//!
//! Configuration is layered: built-in defaults, then an optional
//! `config/cadence.{toml,yaml,json}` file, then `CADENCE__SECTION__KEY`
//! environment variables, then a handful of well-known variables for
//! platform credentials.
//!
//! # Validation
//!
//! [`AppConfig::load`] runs [`ConfigValidator`] and refuses to start on any
//! problem:
//!
//! ```rust,ignore
//! use cadence_engine::config::{AppConfig, ConfigValidator};
//!
//! let config = AppConfig::load_unchecked()?;
//! ConfigValidator::validate(&config)?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backfill::BackfillConfig;
use crate::domain::DEFAULT_FAILURE_THRESHOLD;
use crate::poller::PollerConfig;
use crate::scheduler::ScheduleExecutorConfig;
use crate::window::DEFAULT_REPORTING_LAG_DAYS;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Control API listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// Schedule loop and status polling.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Historical backfill limits.
    #[serde(default)]
    pub backfill: BackfillSettings,
    /// Execution platform connection.
    #[serde(default)]
    pub executor: ExecutorSettings,
    /// Persistence backend.
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Config file looked up when no other path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config/cadence";

impl AppConfig {
    /// Load configuration from environment and files, then validate it.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Like [`AppConfig::load`] with an explicit config file (extension optional).
    pub fn load_from(file: &str) -> anyhow::Result<Self> {
        let config = Self::load_unchecked_from(file)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        Self::load_unchecked_from(DEFAULT_CONFIG_FILE)
    }

    /// Load an explicit config file without validation.
    pub fn load_unchecked_from(file: &str) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", i64::from(default_port()))?
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize()?;

        if let Ok(url) = std::env::var("EXECUTION_PLATFORM_URL") {
            app_config.executor.base_url = Some(url);
        }
        if let Ok(token) = std::env::var("EXECUTION_PLATFORM_TOKEN") {
            app_config.executor.api_token = Some(token);
        }

        Ok(app_config)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Control API port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Schedule loop and poller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between schedule evaluation ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Seconds between status poll rounds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Concurrent status requests per poll round.
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,
    /// Days of upstream reporting lag applied to every window.
    #[serde(default = "default_reporting_lag")]
    pub reporting_lag_days: u32,
    /// Minimum seconds between two dispatches of one schedule.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    /// Failure threshold for schedules created without one.
    #[serde(default = "default_failure_threshold")]
    pub default_failure_threshold: u32,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    15
}

fn default_poll_concurrency() -> usize {
    32
}

fn default_reporting_lag() -> u32 {
    DEFAULT_REPORTING_LAG_DAYS
}

fn default_dedup_window() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            poll_interval_secs: default_poll_interval(),
            poll_concurrency: default_poll_concurrency(),
            reporting_lag_days: default_reporting_lag(),
            dedup_window_secs: default_dedup_window(),
            default_failure_threshold: default_failure_threshold(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn executor_config(&self) -> ScheduleExecutorConfig {
        ScheduleExecutorConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            reporting_lag_days: self.reporting_lag_days,
            dedup_window: Duration::from_secs(self.dedup_window_secs),
        }
    }

    #[must_use]
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_concurrency: self.poll_concurrency,
        }
    }
}

/// Backfill limits as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    /// Collections admitting units at once.
    #[serde(default = "default_max_collections")]
    pub max_concurrent_collections: usize,
    /// In-flight units per collection.
    #[serde(default = "default_max_units")]
    pub max_units_per_collection: usize,
    /// Attempts per unit, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_unit_attempts: u32,
}

fn default_max_collections() -> usize {
    5
}

fn default_max_units() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            max_concurrent_collections: default_max_collections(),
            max_units_per_collection: default_max_units(),
            max_unit_attempts: default_max_attempts(),
        }
    }
}

impl BackfillSettings {
    /// Combine with the engine's reporting lag.
    #[must_use]
    pub fn to_backfill_config(&self, engine: &EngineConfig) -> BackfillConfig {
        BackfillConfig {
            max_concurrent_collections: self.max_concurrent_collections,
            max_units_per_collection: self.max_units_per_collection,
            max_unit_attempts: self.max_unit_attempts,
            reporting_lag_days: engine.reporting_lag_days,
        }
    }
}

/// Execution platform settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Platform base URL. Required unless `dry_run` is set.
    pub base_url: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
    /// Run against the in-process scripted executor instead of a platform.
    #[serde(default)]
    pub dry_run: bool,
    /// Principal whose credential authorises status polls.
    #[serde(default = "default_poll_principal")]
    pub poll_principal: String,
    /// Shared bearer token for platform calls.
    pub api_token: Option<String>,
    /// Platform path that exchanges `api_token` for per-user tokens. Without
    /// it every call uses `api_token` directly.
    #[serde(default)]
    pub token_path: Option<String>,
}

impl std::fmt::Debug for ExecutorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSettings")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("dry_run", &self.dry_run)
            .field("poll_principal", &self.poll_principal)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("token_path", &self.token_path)
            .finish()
    }
}

fn default_executor_timeout() -> u64 {
    30
}

fn default_poll_principal() -> String {
    "cadence-service".to_string()
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_executor_timeout(),
            dry_run: false,
            poll_principal: default_poll_principal(),
            api_token: None,
            token_path: None,
        }
    }
}

/// Persistence backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps; state is lost on restart.
    #[default]
    Memory,
    /// SQLite file (requires the `sqlite` feature).
    Sqlite,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the SQLite backend.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "data/cadence.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to use JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.engine.tick_interval_secs, 60);
        assert_eq!(config.engine.reporting_lag_days, 14);
        assert_eq!(config.backfill.max_units_per_collection, 10);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(!config.executor.dry_run);
    }

    #[test]
    fn test_engine_conversions() {
        let engine = EngineConfig {
            tick_interval_secs: 5,
            poll_interval_secs: 2,
            poll_concurrency: 4,
            reporting_lag_days: 7,
            dedup_window_secs: 30,
            default_failure_threshold: 3,
        };
        let executor = engine.executor_config();
        assert_eq!(executor.tick_interval, Duration::from_secs(5));
        assert_eq!(executor.dedup_window, Duration::from_secs(30));
        assert_eq!(executor.reporting_lag_days, 7);

        let poller = engine.poller_config();
        assert_eq!(poller.interval, Duration::from_secs(2));
        assert_eq!(poller.max_concurrency, 4);

        let backfill = BackfillSettings::default().to_backfill_config(&engine);
        assert_eq!(backfill.reporting_lag_days, 7);
        assert_eq!(backfill.max_concurrent_collections, 5);
    }

    #[test]
    fn test_partial_sections_deserialize() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "engine": { "tick_interval_secs": 10 },
            "store": { "backend": "sqlite" }
        }))
        .unwrap();
        assert_eq!(config.engine.tick_interval_secs, 10);
        assert_eq!(config.engine.poll_interval_secs, 15);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.path, "data/cadence.db");
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let settings = ExecutorSettings {
            api_token: Some("secret-token".to_string()),
            ..ExecutorSettings::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("redacted"));
    }
}
