//! Error types for sesamo-mq

use std::time::Duration;
use thiserror::Error;

use crate::config::duration_millis;

/// Result type for sesamo-mq operations
pub type Result<T> = std::result::Result<T, MqError>;

/// Errors that can occur while consuming queue notifications
///
/// Only [`MqError::Configuration`] and [`MqError::Connection`] end the listener
/// loop as failures. [`MqError::Cancelled`] is the expected result of a
/// shutdown; every other variant is contained within one loop iteration.
#[derive(Error, Debug)]
pub enum MqError {
    /// Invalid setup, e.g. starting without registered consumers
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Notification connection or channel-open failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Malformed envelope or body
    ///
    /// `delivery_id` is present when the outer envelope parsed and only the
    /// body was malformed.
    #[error("Decode error: {message}")]
    Decode {
        delivery_id: Option<i64>,
        message: String,
    },

    /// The registered processor reported a failure
    #[error("Consumer error: {0}")]
    Consumer(#[source] anyhow::Error),

    /// Ack call against the storage engine failed
    #[error("Ack failed for delivery {delivery_id}: {message}")]
    Ack { delivery_id: i64, message: String },

    /// Nack call against the storage engine failed
    #[error("Nack failed for delivery {delivery_id}: {message}")]
    Nack { delivery_id: i64, message: String },

    /// A bounded storage call did not finish in time
    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The listener was cancelled by a shutdown request
    #[error("Listener cancelled")]
    Cancelled,
}

impl MqError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a decode error, keeping the delivery id if one was recovered
    pub fn decode<S: Into<String>>(delivery_id: Option<i64>, message: S) -> Self {
        Self::Decode {
            delivery_id,
            message: message.into(),
        }
    }

    /// Wrap a processor failure
    pub fn consumer<E: Into<anyhow::Error>>(error: E) -> Self {
        Self::Consumer(error.into())
    }

    pub fn ack<S: Into<String>>(delivery_id: i64, message: S) -> Self {
        Self::Ack {
            delivery_id,
            message: message.into(),
        }
    }

    pub fn nack<S: Into<String>>(delivery_id: i64, message: S) -> Self {
        Self::Nack {
            delivery_id,
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: duration_millis(timeout),
        }
    }

    /// True for the expected terminal state of a shutdown
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for errors that terminate the listener loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Connection { .. })
    }
}

impl From<sqlx::Error> for MqError {
    fn from(err: sqlx::Error) -> Self {
        MqError::connection(err.to_string())
    }
}

impl From<config::ConfigError> for MqError {
    fn from(err: config::ConfigError) -> Self {
        MqError::config(err.to_string())
    }
}
