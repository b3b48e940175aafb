//! Notification transport: the blocking wait for the next `NOTIFY` on a
//! subscribed channel.
//!
//! The listener reads notifications on a connection of its own. Ack/Nack and
//! channel management go through the storage pool instead, so no query ever has
//! to interleave with an outstanding wait.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tracing::{debug, info, instrument};

use crate::config::ListenerConfig;
use crate::error::{MqError, Result};

/// One notification delivered on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new<C: Into<String>, P: Into<String>>(channel: C, payload: P) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Source of notifications for the listener loop
///
/// `recv` must be cancel safe: the loop races it against shutdown.
#[async_trait]
pub trait NotificationSource: Send {
    /// Subscribe to a channel
    async fn listen(&mut self, channel: &str) -> Result<()>;

    /// Wait for the next notification on any subscribed channel
    ///
    /// An error means the connection is gone and is fatal to the loop.
    async fn recv(&mut self) -> Result<Notification>;
}

/// [`NotificationSource`] over a dedicated PostgreSQL `LISTEN` connection
pub struct PgNotificationSource {
    listener: PgListener,
}

impl PgNotificationSource {
    /// Open the dedicated notification connection
    pub async fn connect(config: &ListenerConfig) -> Result<Self> {
        config.validate_for_connect()?;
        info!("Connecting notification listener to database");

        let listener = PgListener::connect(&config.database_url)
            .await
            .map_err(|e| MqError::connection(format!("notification connection failed: {e}")))?;

        info!("Successfully connected notification listener");
        Ok(Self { listener })
    }

    pub fn from_listener(listener: PgListener) -> Self {
        Self { listener }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    #[instrument(skip(self))]
    async fn listen(&mut self, channel: &str) -> Result<()> {
        // PgListener quotes the channel identifier itself
        self.listener
            .listen(channel)
            .await
            .map_err(|e| MqError::connection(format!("LISTEN on {channel} failed: {e}")))?;
        debug!("Subscribed to channel");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|e| MqError::connection(format!("notification stream failed: {e}")))?;

        Ok(Notification::new(
            notification.channel(),
            notification.payload(),
        ))
    }
}
