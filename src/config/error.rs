//! Configuration Error Types
//!
//! Errors raised while layering configuration sources and validating the result.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A layered source could not be read or merged
    #[error("Failed to load configuration from {config_dir:?}: {error}")]
    LoadError { config_dir: PathBuf, error: String },

    /// Merged values did not deserialize into the configuration structure
    #[error("Invalid configuration structure: {error}")]
    InvalidStructure { error: String },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

impl ConfigurationError {
    pub fn load_error<E: std::fmt::Display>(config_dir: impl Into<PathBuf>, error: E) -> Self {
        Self::LoadError {
            config_dir: config_dir.into(),
            error: error.to_string(),
        }
    }

    pub fn invalid_structure<E: std::fmt::Display>(error: E) -> Self {
        Self::InvalidStructure {
            error: error.to_string(),
        }
    }

    /// Create a missing required field error
    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value<F: Into<String>, V: Into<String>, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
