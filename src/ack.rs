//! Ack/Nack calls confirming the outcome of a delivery.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{MqError, Result};
use crate::store::MqStore;

/// Confirms or rejects deliveries through the storage engine's queue procedures
#[derive(Clone)]
pub struct AckClient {
    store: Arc<dyn MqStore>,
}

impl std::fmt::Debug for AckClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckClient").finish_non_exhaustive()
    }
}

impl AckClient {
    pub fn new(store: Arc<dyn MqStore>) -> Self {
        Self { store }
    }

    /// Acknowledge a processed delivery
    #[instrument(skip(self))]
    pub async fn ack(&self, delivery_id: i64) -> Result<()> {
        if delivery_id <= 0 {
            return Err(MqError::ack(delivery_id, "delivery id must be positive"));
        }

        self.store
            .ack(delivery_id)
            .await
            .map_err(|e| MqError::ack(delivery_id, e.to_string()))?;

        debug!("Message ACK successfully");
        Ok(())
    }

    /// Reject a delivery so it becomes eligible again after `retry_after`
    #[instrument(skip(self))]
    pub async fn nack(&self, delivery_id: i64, retry_after: &str) -> Result<()> {
        if delivery_id <= 0 {
            return Err(MqError::nack(delivery_id, "delivery id must be positive"));
        }

        self.store
            .nack(delivery_id, retry_after)
            .await
            .map_err(|e| MqError::nack(delivery_id, e.to_string()))?;

        debug!("Message NACK successfully");
        Ok(())
    }
}
