//! Configuration validation.
//!
//! Every problem is collected so a misconfigured deployment is reported
//! in one pass rather than one restart per mistake.

use super::error::{ConfigResult, ConfigurationError};
use super::{AppConfig, BackfillSettings, EngineConfig, ExecutorSettings, StoreBackend, StoreConfig};
use crate::window::MAX_LOOKBACK_DAYS;

/// Checks an [`AppConfig`] before the engine starts.
///
/// | Setting                       | Rule                                |
/// |-------------------------------|-------------------------------------|
/// | engine intervals              | greater than zero                   |
/// | `engine.reporting_lag_days`   | at most 365                         |
/// | `engine.poll_concurrency`     | at least 1                          |
/// | backfill limits               | at least 1                          |
/// | `executor.base_url`           | required unless `dry_run`           |
/// | `executor.api_token`          | required unless `dry_run`           |
/// | `executor.dry_run`            | not combined with `base_url`        |
/// | `executor.token_path`         | starts with `/`                     |
/// | `store.backend=sqlite`        | needs the `sqlite` feature and path |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        for result in [
            Self::validate_engine(&config.engine),
            Self::validate_backfill(&config.backfill),
            Self::validate_executor(&config.executor),
            Self::validate_store(&config.store),
        ] {
            match result {
                Ok(()) => {}
                Err(ConfigurationError::Multiple(errs)) => errors.extend(errs),
                Err(e) => errors.push(e),
            }
        }

        ConfigurationError::from_list(errors).map_or(Ok(()), Err)
    }

    /// Validate loop timing and window settings.
    pub fn validate_engine(engine: &EngineConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if engine.tick_interval_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.tick_interval_secs must be greater than zero",
                "Set CADENCE__ENGINE__TICK_INTERVAL_SECS, typically 60",
            ));
        }
        if engine.poll_interval_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.poll_interval_secs must be greater than zero",
                "Set CADENCE__ENGINE__POLL_INTERVAL_SECS, typically 15",
            ));
        }
        if engine.poll_concurrency == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.poll_concurrency must be at least 1",
                "Set CADENCE__ENGINE__POLL_CONCURRENCY to the number of concurrent status requests",
            ));
        }
        if engine.reporting_lag_days > MAX_LOOKBACK_DAYS {
            errors.push(ConfigurationError::invalid(
                format!(
                    "engine.reporting_lag_days is {}, above the {MAX_LOOKBACK_DAYS} day limit",
                    engine.reporting_lag_days
                ),
                "Lower CADENCE__ENGINE__REPORTING_LAG_DAYS",
            ));
        }
        if engine.default_failure_threshold == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.default_failure_threshold must be at least 1",
                "Set CADENCE__ENGINE__DEFAULT_FAILURE_THRESHOLD, typically 3",
            ));
        }

        ConfigurationError::from_list(errors).map_or(Ok(()), Err)
    }

    /// Validate backfill admission limits.
    pub fn validate_backfill(backfill: &BackfillSettings) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if backfill.max_concurrent_collections == 0 {
            errors.push(ConfigurationError::invalid(
                "backfill.max_concurrent_collections must be at least 1",
                "Set CADENCE__BACKFILL__MAX_CONCURRENT_COLLECTIONS, typically 5",
            ));
        }
        if backfill.max_units_per_collection == 0 {
            errors.push(ConfigurationError::invalid(
                "backfill.max_units_per_collection must be at least 1",
                "Set CADENCE__BACKFILL__MAX_UNITS_PER_COLLECTION, typically 10",
            ));
        }
        if backfill.max_unit_attempts == 0 {
            errors.push(ConfigurationError::invalid(
                "backfill.max_unit_attempts must be at least 1",
                "Set CADENCE__BACKFILL__MAX_UNIT_ATTEMPTS, typically 3",
            ));
        }

        ConfigurationError::from_list(errors).map_or(Ok(()), Err)
    }

    /// Validate the execution platform connection.
    pub fn validate_executor(executor: &ExecutorSettings) -> ConfigResult<()> {
        if executor.dry_run {
            if executor.base_url.is_some() {
                return Err(ConfigurationError::incompatible(
                    "executor.dry_run",
                    "executor.base_url",
                    "a dry run never contacts the platform; unset one of them",
                ));
            }
            return Ok(());
        }

        let mut errors = Vec::new();

        match executor.base_url.as_deref().map(str::trim) {
            None | Some("") => errors.push(ConfigurationError::missing_required(
                "executor.base_url",
                "Submitting queries to the execution platform",
                "EXECUTION_PLATFORM_URL or CADENCE__EXECUTOR__BASE_URL \
                (or set CADENCE__EXECUTOR__DRY_RUN=true)",
            )),
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                errors.push(ConfigurationError::invalid(
                    format!("executor.base_url '{url}' is not an http(s) URL"),
                    "Use a full URL such as https://platform.example.com",
                ));
            }
            Some(_) => {}
        }

        if executor.api_token.as_deref().is_none_or(str::is_empty) {
            errors.push(ConfigurationError::missing_required(
                "executor.api_token",
                "Authenticating submissions and status polls",
                "EXECUTION_PLATFORM_TOKEN or CADENCE__EXECUTOR__API_TOKEN",
            ));
        }
        if let Some(path) = executor.token_path.as_deref() {
            if !path.starts_with('/') {
                errors.push(ConfigurationError::invalid(
                    format!("executor.token_path '{path}' must start with '/'"),
                    "Use a path on the platform such as /v1/auth/token",
                ));
            }
        }
        if executor.timeout_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "executor.timeout_secs must be greater than zero",
                "Set CADENCE__EXECUTOR__TIMEOUT_SECS, typically 30",
            ));
        }

        ConfigurationError::from_list(errors).map_or(Ok(()), Err)
    }

    /// Validate the persistence backend.
    pub fn validate_store(store: &StoreConfig) -> ConfigResult<()> {
        match store.backend {
            StoreBackend::Memory => Ok(()),
            StoreBackend::Sqlite => {
                Self::validate_feature_flags_for_sqlite()?;
                if store.path.trim().is_empty() {
                    return Err(ConfigurationError::missing_required(
                        "store.path",
                        "Opening the SQLite store",
                        "CADENCE__STORE__PATH",
                    ));
                }
                Ok(())
            }
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn validate_feature_flags_for_sqlite() -> ConfigResult<()> {
        Ok(())
    }

    #[cfg(not(feature = "sqlite"))]
    pub fn validate_feature_flags_for_sqlite() -> ConfigResult<()> {
        Err(ConfigurationError::feature_unavailable(
            "SQLite store",
            "The 'sqlite' feature is not enabled in this build",
            "Use CADENCE__STORE__BACKEND=memory, or rebuild with --features sqlite",
        ))
    }
}
