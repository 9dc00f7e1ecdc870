//! Configuration for the acknowledgment subsystem
//!
//! All thresholds are validated before any component is built. A config that
//! fails validation is fatal: the service refuses to start instead of running
//! with thresholds that would make the retry or timeout machinery misbehave.

pub mod ack_config;
pub mod sync_config;

pub use ack_config::*;
pub use sync_config::*;

use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration validation error: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Environment variable error: {var} - {reason}")]
    EnvVarError { var: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Configuration validation trait
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Configuration loading trait
pub trait ConfigLoader<T> {
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<T, ConfigError>;
    fn load_from_env() -> Result<T, ConfigError>;
}

/// Reads a numeric override from the environment, if set.
pub(crate) fn env_override<N: std::str::FromStr>(var: &str) -> Result<Option<N>, ConfigError>
where
    N::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<N>()
            .map(Some)
            .map_err(|e| ConfigError::EnvVarError {
                var: var.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
