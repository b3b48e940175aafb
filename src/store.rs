//! # Queue storage procedures
//!
//! The storage engine owns the queues, retry scheduling and channel lifecycle.
//! [`MqStore`] is the narrow set of procedures the listener needs from it;
//! [`PgMqStore`] calls them on PostgreSQL through a connection pool. Every
//! value is passed as a bound parameter.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

use crate::config::ListenerConfig;
use crate::error::Result;

/// Storage-side queue procedures used by the listener
#[async_trait]
pub trait MqStore: Send + Sync {
    /// Open a notification channel for a queue and return its id
    async fn open_channel(&self, queue_name: &str, priority: i32) -> Result<String>;

    async fn close_channel(&self, channel_id: &str) -> Result<()>;

    /// Reap channels whose listening sessions are gone
    async fn close_dead_channels(&self) -> Result<()>;

    async fn ack(&self, delivery_id: i64) -> Result<()>;

    /// Return a delivery to its queue, eligible again after `retry_after`
    async fn nack(&self, delivery_id: i64, retry_after: &str) -> Result<()>;
}

/// [`MqStore`] backed by the `mq` schema procedures in PostgreSQL
#[derive(Debug, Clone)]
pub struct PgMqStore {
    pool: PgPool,
}

impl PgMqStore {
    /// Use an existing pool (BYOP - Bring Your Own Pool)
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the storage pool from configuration
    pub async fn connect(config: &ListenerConfig) -> Result<Self> {
        config.validate_for_connect()?;
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting queue storage pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime())
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MqStore for PgMqStore {
    #[instrument(skip(self), fields(queue = %queue_name))]
    async fn open_channel(&self, queue_name: &str, priority: i32) -> Result<String> {
        let channel_id: String = sqlx::query_scalar("SELECT mq.open_channel($1, $2)::text")
            .bind(queue_name)
            .bind(priority)
            .fetch_one(&self.pool)
            .await?;

        debug!(channel_id = %channel_id, "Opened channel");
        Ok(channel_id)
    }

    #[instrument(skip(self))]
    async fn close_channel(&self, channel_id: &str) -> Result<()> {
        // Channel ids are numeric on the storage side; the text form is cast back there
        sqlx::query("CALL mq.close_channel($1::bigint)")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn close_dead_channels(&self) -> Result<()> {
        sqlx::query("CALL mq.close_dead_channels()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ack(&self, delivery_id: i64) -> Result<()> {
        sqlx::query("CALL mq.ack($1)")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn nack(&self, delivery_id: i64, retry_after: &str) -> Result<()> {
        sqlx::query("CALL mq.nack($1, retry_after => $2::interval)")
            .bind(delivery_id)
            .bind(retry_after)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
