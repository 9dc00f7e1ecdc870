//! Acknowledgment thresholds

use super::{ConfigError, Validate};
use crate::types::AckPriority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the outcome cache lifetime, one week
pub const MAX_CACHE_EXPIRATION_MINUTES: u64 = 7 * 24 * 60;

/// Upper bound on the high-latency activity multiplier
pub const MAX_ACTIVITY_TIMEOUT_MULTIPLIER: f64 = 100.0;

/// Numeric thresholds governing batching, retries, timeouts and the outcome
/// cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcknowledgmentConfiguration {
    /// Per-call timeout for a single transport send
    pub default_timeout_seconds: u64,

    /// Retries after the first attempt before an exchange is marked failed
    pub max_retry_attempts: u32,

    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,

    /// A batch flushes as soon as it holds this many items
    pub max_batch_size: usize,

    /// ... or once its oldest item is this old
    pub batch_timeout_ms: u64,

    /// Outstanding acknowledgments allowed per peer; the oldest is dropped
    /// when a new push would exceed it
    pub max_pending_per_user: usize,

    pub high_priority_timeout_seconds: u64,
    pub medium_priority_timeout_seconds: u64,
    pub low_priority_timeout_seconds: u64,

    pub max_cache_size: usize,
    pub cache_expiration_minutes: u64,

    /// When disabled every dispatch is sent directly
    pub enable_batching: bool,

    /// Applied to send timeouts while the local player is in a high-latency
    /// activity
    pub activity_timeout_multiplier: f64,
}

impl Default for AcknowledgmentConfiguration {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
            max_retry_attempts: 3,
            base_retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_batch_size: 10,
            batch_timeout_ms: 500,
            max_pending_per_user: 5,
            high_priority_timeout_seconds: 15,
            medium_priority_timeout_seconds: 30,
            low_priority_timeout_seconds: 60,
            max_cache_size: 1000,
            cache_expiration_minutes: 30,
            enable_batching: true,
            activity_timeout_multiplier: 3.0,
        }
    }
}

impl AcknowledgmentConfiguration {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn base_timeout_for(&self, priority: AckPriority) -> Duration {
        let secs = match priority {
            AckPriority::High => self.high_priority_timeout_seconds,
            AckPriority::Medium => self.medium_priority_timeout_seconds,
            AckPriority::Low => self.low_priority_timeout_seconds,
        };
        Duration::from_secs(secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.cache_expiration_minutes.saturating_mul(60))
    }
}

impl Validate for AcknowledgmentConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "acknowledgment.default_timeout_seconds",
                "Default timeout must be greater than 0",
            ));
        }

        if self.base_retry_delay_ms == 0 {
            return Err(ConfigError::invalid(
                "acknowledgment.base_retry_delay_ms",
                "Base retry delay must be greater than 0",
            ));
        }

        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ConfigError::invalid(
                "acknowledgment.max_retry_delay_ms",
                format!(
                    "Max retry delay ({}ms) must not be below the base delay ({}ms)",
                    self.max_retry_delay_ms, self.base_retry_delay_ms
                ),
            ));
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid(
                "acknowledgment.max_batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if self.batch_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "acknowledgment.batch_timeout_ms",
                "Batch timeout must be greater than 0",
            ));
        }

        if self.max_pending_per_user == 0 {
            return Err(ConfigError::invalid(
                "acknowledgment.max_pending_per_user",
                "Max pending per user must be greater than 0",
            ));
        }

        for (field, value) in [
            ("acknowledgment.high_priority_timeout_seconds", self.high_priority_timeout_seconds),
            ("acknowledgment.medium_priority_timeout_seconds", self.medium_priority_timeout_seconds),
            ("acknowledgment.low_priority_timeout_seconds", self.low_priority_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "Priority timeout must be greater than 0"));
            }
        }

        if self.max_cache_size == 0 {
            return Err(ConfigError::invalid(
                "acknowledgment.max_cache_size",
                "Cache size must be greater than 0",
            ));
        }

        if self.cache_expiration_minutes == 0
            || self.cache_expiration_minutes > MAX_CACHE_EXPIRATION_MINUTES
        {
            return Err(ConfigError::invalid(
                "acknowledgment.cache_expiration_minutes",
                format!(
                    "Cache expiration must be between 1 and {MAX_CACHE_EXPIRATION_MINUTES} minutes"
                ),
            ));
        }

        if !(1.0..=MAX_ACTIVITY_TIMEOUT_MULTIPLIER).contains(&self.activity_timeout_multiplier) {
            return Err(ConfigError::invalid(
                "acknowledgment.activity_timeout_multiplier",
                format!(
                    "Activity multiplier must be between 1.0 and {MAX_ACTIVITY_TIMEOUT_MULTIPLIER}"
                ),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(AcknowledgmentConfiguration::default().validate().is_ok());
    }

    #[test]
    fn max_delay_below_base_is_rejected() {
        let config = AcknowledgmentConfiguration {
            base_retry_delay_ms: 2000,
            max_retry_delay_ms: 1000,
            ..Default::default()
        };
        match config.validate() {
            Err(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field, "acknowledgment.max_retry_delay_ms")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn zero_retries_are_allowed() {
        let config = AcknowledgmentConfiguration {
            max_retry_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn every_zero_threshold_is_rejected() {
        let cases: [fn(&mut AcknowledgmentConfiguration); 10] = [
            |c| c.default_timeout_seconds = 0,
            |c| c.base_retry_delay_ms = 0,
            |c| c.max_batch_size = 0,
            |c| c.batch_timeout_ms = 0,
            |c| c.max_pending_per_user = 0,
            |c| c.high_priority_timeout_seconds = 0,
            |c| c.medium_priority_timeout_seconds = 0,
            |c| c.low_priority_timeout_seconds = 0,
            |c| c.max_cache_size = 0,
            |c| c.cache_expiration_minutes = 0,
        ];
        for mutate in cases {
            let mut config = AcknowledgmentConfiguration::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn priority_timeouts_map_to_their_fields() {
        let config = AcknowledgmentConfiguration::default();
        assert_eq!(config.base_timeout_for(AckPriority::High), Duration::from_secs(15));
        assert_eq!(config.base_timeout_for(AckPriority::Medium), Duration::from_secs(30));
        assert_eq!(config.base_timeout_for(AckPriority::Low), Duration::from_secs(60));
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let cases: [fn(&mut AcknowledgmentConfiguration); 4] = [
            |c| c.cache_expiration_minutes = u64::MAX,
            |c| c.activity_timeout_multiplier = 1e300,
            |c| c.activity_timeout_multiplier = f64::INFINITY,
            |c| c.activity_timeout_multiplier = f64::NAN,
        ];
        for mutate in cases {
            let mut config = AcknowledgmentConfiguration::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }

        let config = AcknowledgmentConfiguration {
            cache_expiration_minutes: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.cache_expiration(), Duration::from_secs(u64::MAX));
    }
}
