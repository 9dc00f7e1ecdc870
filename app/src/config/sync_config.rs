//! Top-level subsystem configuration

use super::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Aggregated configuration for every component of the sync service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub acknowledgment: AcknowledgmentConfiguration,

    pub watchdog: WatchdogConfig,

    /// Receiving-side application of pushed data
    pub apply: ApplyConfig,

    pub distributor: DistributorConfig,

    /// Intervals of the housekeeping tasks
    pub maintenance: MaintenanceConfig,
}

/// Timeout watchdog configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// How often outstanding acknowledgments are checked
    pub poll_interval: Duration,

    /// Grace period given to a peer whose acknowledged hash went stale
    pub invalid_hash_timeout: Duration,
}

/// Deferred application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Poll interval while waiting for a render handle
    pub handle_poll_interval: Duration,

    /// Give up waiting for the render handle after this long
    pub handle_timeout: Duration,

    /// Give up waiting for the application-completed signal after this long
    pub completion_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub batch_sweep_interval: Duration,
    pub retry_scan_interval: Duration,
    pub cache_cleanup_interval: Duration,
    pub session_sweep_interval: Duration,

    /// Requests older than this are dropped even if never answered
    pub session_max_age: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            invalid_hash_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            handle_poll_interval: Duration::from_millis(250),
            handle_timeout: Duration::from_secs(120),
            completion_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            batch_sweep_interval: Duration::from_millis(100),
            retry_scan_interval: Duration::from_millis(250),
            cache_cleanup_interval: Duration::from_secs(60),
            session_sweep_interval: Duration::from_secs(60),
            session_max_age: Duration::from_secs(600),
        }
    }
}

fn require_nonzero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(field, "Interval must be greater than 0"));
    }
    Ok(())
}

impl Validate for SyncConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.acknowledgment.validate()?;

        require_nonzero("watchdog.poll_interval", self.watchdog.poll_interval)?;
        require_nonzero("watchdog.invalid_hash_timeout", self.watchdog.invalid_hash_timeout)?;

        require_nonzero("apply.handle_poll_interval", self.apply.handle_poll_interval)?;
        require_nonzero("apply.handle_timeout", self.apply.handle_timeout)?;
        require_nonzero("apply.completion_timeout", self.apply.completion_timeout)?;
        if self.apply.handle_poll_interval > self.apply.handle_timeout {
            return Err(ConfigError::invalid(
                "apply.handle_poll_interval",
                "Poll interval must not exceed the handle timeout",
            ));
        }

        require_nonzero("distributor.heartbeat_interval", self.distributor.heartbeat_interval)?;

        require_nonzero("maintenance.batch_sweep_interval", self.maintenance.batch_sweep_interval)?;
        require_nonzero("maintenance.retry_scan_interval", self.maintenance.retry_scan_interval)?;
        require_nonzero(
            "maintenance.cache_cleanup_interval",
            self.maintenance.cache_cleanup_interval,
        )?;
        require_nonzero(
            "maintenance.session_sweep_interval",
            self.maintenance.session_sweep_interval,
        )?;
        require_nonzero("maintenance.session_max_age", self.maintenance.session_max_age)?;

        Ok(())
    }
}

impl ConfigLoader<SyncConfig> for SyncConfig {
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<SyncConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|_| ConfigError::FileNotFound {
                path: path.as_ref().display().to_string(),
            })?;

        let config: SyncConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<SyncConfig, ConfigError> {
        let mut config = SyncConfig::default();
        let ack = &mut config.acknowledgment;

        if let Some(v) = env_override("SNAPSYNC_MAX_RETRY_ATTEMPTS")? {
            ack.max_retry_attempts = v;
        }
        if let Some(v) = env_override("SNAPSYNC_BASE_RETRY_DELAY_MS")? {
            ack.base_retry_delay_ms = v;
        }
        if let Some(v) = env_override("SNAPSYNC_MAX_RETRY_DELAY_MS")? {
            ack.max_retry_delay_ms = v;
        }
        if let Some(v) = env_override("SNAPSYNC_MAX_BATCH_SIZE")? {
            ack.max_batch_size = v;
        }
        if let Some(v) = env_override("SNAPSYNC_BATCH_TIMEOUT_MS")? {
            ack.batch_timeout_ms = v;
        }
        if let Some(v) = env_override("SNAPSYNC_MAX_CACHE_SIZE")? {
            ack.max_cache_size = v;
        }
        if let Some(secs) = env_override::<u64>("SNAPSYNC_WATCHDOG_POLL_SECS")? {
            config.watchdog.poll_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_validates() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn nested_ack_errors_surface() {
        let mut config = SyncConfig::default();
        config.acknowledgment.max_batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "acknowledgment.max_batch_size"
        ));
    }

    #[test]
    fn poll_longer_than_timeout_is_rejected() {
        let mut config = SyncConfig::default();
        config.apply.handle_poll_interval = Duration::from_secs(10);
        config.apply.handle_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[acknowledgment]\nmax_batch_size = 4\nmax_retry_attempts = 1\n"
        )
        .unwrap();

        let config = SyncConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.acknowledgment.max_batch_size, 4);
        assert_eq!(config.acknowledgment.max_retry_attempts, 1);
        assert_eq!(config.watchdog, WatchdogConfig::default());
    }

    #[test]
    fn invalid_file_values_are_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[acknowledgment]\nmax_cache_size = 0\n").unwrap();
        assert!(matches!(
            SyncConfig::load_from_file(file.path()),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            SyncConfig::load_from_file("/nonexistent/snapsync.toml"),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}
