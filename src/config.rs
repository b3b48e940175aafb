//! # Listener configuration
//!
//! Settings for the notification listener: retry windows used for Nack calls,
//! shutdown timing, channel priority and the storage pool limits. Values are
//! layered with the `config` crate: built-in defaults, then `SESAMO_MQ_*`
//! environment variables, then `DATABASE_URL`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MqError, Result};

/// Environment variable prefix for listener settings
pub const ENV_PREFIX: &str = "SESAMO_MQ";

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration for one listener instance
///
/// # Examples
///
/// ```rust
/// use sesamo_mq::config::ListenerConfig;
/// use std::time::Duration;
///
/// let config = ListenerConfig::new()
///     .with_failure_retry_after("10 minutes")
///     .with_shutdown_grace_period(Duration::from_millis(250));
///
/// assert_eq!(config.failure_retry_after, "10 minutes");
/// assert_eq!(config.ack_failure_retry_after, "1 minute");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// PostgreSQL connection string shared by the storage pool and the
    /// dedicated notification connection
    pub database_url: String,

    /// Priority passed to `mq.open_channel`
    pub channel_priority: i32,

    /// Retry window for consumer failures and the shutdown compensating Nack
    pub failure_retry_after: String,

    /// Retry window for the compensating Nack after a failed Ack
    pub ack_failure_retry_after: String,

    /// Time given to the loop to observe cancellation before channels are torn down
    pub shutdown_grace_period_ms: u64,

    /// Bound on each channel cleanup call during shutdown
    pub cleanup_timeout_ms: u64,

    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            channel_priority: 1,
            failure_retry_after: "5 minutes".to_string(),
            ack_failure_retry_after: "1 minute".to_string(),
            shutdown_grace_period_ms: 100,
            cleanup_timeout_ms: 3000,
            max_connections: 4,
            min_connections: 2,
            max_lifetime_secs: 30 * 60,
        }
    }
}

impl ListenerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_database_url<S: Into<String>>(mut self, url: S) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_channel_priority(mut self, priority: i32) -> Self {
        self.channel_priority = priority;
        self
    }

    pub fn with_failure_retry_after<S: Into<String>>(mut self, interval: S) -> Self {
        self.failure_retry_after = interval.into();
        self
    }

    pub fn with_ack_failure_retry_after<S: Into<String>>(mut self, interval: S) -> Self {
        self.ack_failure_retry_after = interval.into();
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period_ms = duration_millis(grace);
        self
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.failure_retry_after.trim().is_empty() {
            return Err(MqError::config("failure_retry_after must not be empty"));
        }

        if self.ack_failure_retry_after.trim().is_empty() {
            return Err(MqError::config("ack_failure_retry_after must not be empty"));
        }

        if self.cleanup_timeout_ms == 0 {
            return Err(MqError::config("cleanup_timeout_ms must be greater than 0"));
        }

        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(MqError::config(format!(
                "invalid pool bounds: min_connections={} max_connections={}",
                self.min_connections, self.max_connections
            )));
        }

        Ok(())
    }

    /// Validate and additionally require a database url
    pub fn validate_for_connect(&self) -> Result<()> {
        self.validate()?;
        if self.database_url.is_empty() {
            return Err(MqError::config(
                "database_url is not set (DATABASE_URL or SESAMO_MQ_DATABASE_URL)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_priority, 1);
        assert_eq!(config.failure_retry_after, "5 minutes");
        assert_eq!(config.ack_failure_retry_after, "1 minute");
        assert_eq!(config.shutdown_grace_period(), Duration::from_millis(100));
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(3));
        assert_eq!(config.max_lifetime(), Duration::from_secs(1800));
    }

    #[test]
    fn test_validation() {
        let config = ListenerConfig::new().with_failure_retry_after("  ");
        assert!(config.validate().is_err());

        let config = ListenerConfig::new().with_cleanup_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let mut config = ListenerConfig::new();
        config.min_connections = 8;
        assert!(config.validate().is_err());

        // Pool and timing are fine, but connecting needs a url
        let config = ListenerConfig::new();
        assert!(matches!(
            config.validate_for_connect(),
            Err(MqError::Configuration { .. })
        ));
        let config = config.with_database_url("postgresql://localhost/sesamo");
        assert!(config.validate_for_connect().is_ok());
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let config = ListenerConfig::new()
            .with_cleanup_timeout(Duration::MAX)
            .with_shutdown_grace_period(Duration::MAX);

        assert_eq!(config.cleanup_timeout_ms, u64::MAX);
        assert_eq!(config.shutdown_grace_period_ms, u64::MAX);
        assert_eq!(duration_millis(Duration::from_micros(2500)), 2);
    }

    #[test]
    fn test_deserialize_partial_document() {
        let config: ListenerConfig = serde_json::from_value(serde_json::json!({
            "failure_retry_after": "2 minutes",
            "cleanup_timeout_ms": 500
        }))
        .unwrap();

        assert_eq!(config.failure_retry_after, "2 minutes");
        assert_eq!(config.cleanup_timeout(), Duration::from_millis(500));
        assert_eq!(config.ack_failure_retry_after, "1 minute");
    }
}
