//! # Configuration System
//!
//! Layered configuration for the orchestration engine.
//!
//! ## Sources
//!
//! Later sources override earlier ones:
//!
//! 1. Built-in defaults (`#[serde(default)]` on every section)
//! 2. `config/docbatch.toml`
//! 3. `config/docbatch.{environment}.toml`
//! 4. `DOCBATCH__SECTION__KEY` environment variables
//!
//! The environment is detected from `DOCBATCH_ENV`, then `APP_ENV`, and
//! defaults to `development`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docbatch_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().engine.worker_count;
//! let timeout = manager.config().execution.conversion_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Slack between the conversion timeout and the stuck-unit timeout, covering
/// the time an executor needs to record a timed-out attempt
pub const STUCK_UNIT_MARGIN_SECONDS: u64 = 10;

/// Root configuration structure mirroring `docbatch.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker pool sizing
    pub engine: EngineConfig,

    /// Per-unit retry policy
    pub retry: RetryConfig,

    /// Converter invocation limits
    pub execution: ExecutionConfig,

    /// Stuck-unit sweep
    pub recovery: RecoveryConfig,

    /// Filesystem layout and converter command
    pub storage: StorageConfig,

    pub logging: LoggingConfig,

    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of unit attempts running at once
    pub worker_count: usize,
    /// Capacity of the dispatch channel feeding the pool
    pub dispatch_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            dispatch_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts a unit may start, including the first
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `attempt` (1-based), doubling each
    /// time and capped at `backoff_max_ms`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub conversion_timeout_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            conversion_timeout_seconds: 120,
        }
    }
}

impl ExecutionConfig {
    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// A `PROCESSING` unit whose attempt started longer ago than this is stuck
    pub stuck_unit_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// Age a terminal unit must reach before its missing barrier
    /// notification is re-delivered
    pub notification_grace_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stuck_unit_timeout_seconds: 600,
            sweep_interval_seconds: 60,
            notification_grace_seconds: 30,
        }
    }
}

impl RecoveryConfig {
    pub fn stuck_unit_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_unit_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn notification_grace(&self) -> Duration {
        Duration::from_secs(self.notification_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for per-job `input/`, `output/` and `result.zip`
    pub work_dir: PathBuf,
    /// Member extensions that become units (case-insensitive, no dot)
    pub accepted_extensions: Vec<String>,
    pub converter_program: String,
    pub output_format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/docbatch"),
            accepted_extensions: vec!["docx".to_string()],
            converter_program: "libreoffice".to_string(),
            output_format: "pdf".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Overrides the environment-derived level when `RUST_LOG` is unset
    pub level: Option<String>,
    /// Enables the JSON file layer
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            log_dir: None,
            file_prefix: "docbatch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Falls back to `DATABASE_URL` when unset
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn database_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

impl BatchConfig {
    /// Age past which a `PROCESSING` unit can no longer have a live attempt.
    ///
    /// Never shorter than the conversion timeout plus
    /// [`STUCK_UNIT_MARGIN_SECONDS`], so the sweep cannot release an attempt
    /// that is still running even when handed an unvalidated configuration.
    pub fn stuck_unit_threshold(&self) -> Duration {
        let floor = self
            .execution
            .conversion_timeout_seconds
            .saturating_add(STUCK_UNIT_MARGIN_SECONDS);
        Duration::from_secs(self.recovery.stuck_unit_timeout_seconds.max(floor))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.engine.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.worker_count",
                "0",
                "worker count must be greater than 0",
            ));
        }

        if self.engine.dispatch_queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.dispatch_queue_capacity",
                "0",
                "dispatch queue capacity must be greater than 0",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                "0",
                "a unit needs at least one attempt",
            ));
        }

        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(ConfigurationError::invalid_value(
                "retry.backoff_base_ms",
                self.retry.backoff_base_ms.to_string(),
                "base delay exceeds retry.backoff_max_ms",
            ));
        }

        if self.execution.conversion_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.conversion_timeout_seconds",
                "0",
                "conversion timeout must be greater than 0",
            ));
        }

        if self.recovery.stuck_unit_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "recovery.stuck_unit_timeout_seconds",
                "0",
                "stuck unit timeout must be greater than 0",
            ));
        }

        let minimum_stuck = self
            .execution
            .conversion_timeout_seconds
            .saturating_add(STUCK_UNIT_MARGIN_SECONDS);
        if self.recovery.stuck_unit_timeout_seconds <= minimum_stuck {
            return Err(ConfigurationError::invalid_value(
                "recovery.stuck_unit_timeout_seconds",
                self.recovery.stuck_unit_timeout_seconds.to_string(),
                format!(
                    "must exceed execution.conversion_timeout_seconds + {STUCK_UNIT_MARGIN_SECONDS} ({minimum_stuck})"
                ),
            ));
        }

        if self.recovery.enabled && self.recovery.sweep_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "recovery.sweep_interval_seconds",
                "0",
                "sweep interval must be greater than 0",
            ));
        }

        if self.storage.accepted_extensions.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "storage.accepted_extensions",
                "storage configuration",
            ));
        }

        if self.storage.converter_program.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "storage.converter_program",
                "storage configuration",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.execution.conversion_timeout(), Duration::from_secs(120));
        assert_eq!(config.storage.accepted_extensions, vec!["docx".to_string()]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = BatchConfig::default();
        config.engine.worker_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("engine.worker_count"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = BatchConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stuck_timeout_must_outlast_conversion_timeout() {
        let mut config = BatchConfig::default();
        config.execution.conversion_timeout_seconds = 30;
        config.recovery.stuck_unit_timeout_seconds = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("recovery.stuck_unit_timeout_seconds"));

        config.recovery.stuck_unit_timeout_seconds = 30 + STUCK_UNIT_MARGIN_SECONDS;
        assert!(config.validate().is_err());

        config.recovery.stuck_unit_timeout_seconds = 31 + STUCK_UNIT_MARGIN_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stuck_threshold_never_undercuts_conversion_timeout() {
        let mut config = BatchConfig::default();
        config.execution.conversion_timeout_seconds = 30;
        config.recovery.stuck_unit_timeout_seconds = 1;
        assert_eq!(
            config.stuck_unit_threshold(),
            Duration::from_secs(30 + STUCK_UNIT_MARGIN_SECONDS)
        );

        config.recovery.stuck_unit_timeout_seconds = 600;
        assert_eq!(config.stuck_unit_threshold(), Duration::from_secs(600));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(350));
        assert_eq!(retry.backoff_for(40), Duration::from_millis(350));
    }
}
