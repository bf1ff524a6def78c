//! # Structured Logging Module
//!
//! Environment-aware structured logging: a console layer always, plus a JSON
//! file layer when `logging.log_dir` is configured.

use chrono::Utc;
use std::fs;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging for `environment`.
///
/// Idempotent. An already-installed global subscriber is left in place.
pub fn init_structured_logging(config: &LoggingConfig, environment: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let log_level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(environment).to_string());
        let console_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(console_filter);

        let pid = process::id();
        let mut guard = None;
        let mut log_file = None;

        let file_layer = config.log_dir.as_ref().and_then(|log_dir| {
            if let Err(e) = fs::create_dir_all(log_dir) {
                eprintln!(
                    "docbatch: cannot create log directory {}: {e}",
                    log_dir.display()
                );
                return None;
            }

            let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
            let file_name = format!("{}.{environment}.{pid}.{timestamp}.log", config.file_prefix);
            log_file = Some(log_dir.join(&file_name));

            let appender = tracing_appender::rolling::never(log_dir, file_name);
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);

            let file_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(file_filter),
            )
        });

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = ?log_file,
            "🔧 STRUCTURED LOGGING: Initialized"
        );

        guard
    });
}

/// Log level for an environment when neither `RUST_LOG` nor `logging.level` is set
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "test" => "debug",
        "development" => "debug",
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for job operations
pub fn log_job_operation(operation: &str, job_id: Uuid, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 JOB_OPERATION"
    );
}

/// Log structured data for unit operations
pub fn log_unit_operation(
    operation: &str,
    job_id: Uuid,
    unit_id: Uuid,
    attempt: Option<u32>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        unit_id = %unit_id,
        attempt = attempt,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 UNIT_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
