//! # Channel registry
//!
//! Tracks the storage-side channel opened for each registered queue. Each
//! queue gets exactly one channel at listener start; the channel id is what
//! notifications arrive on, so the registry is also how the listener maps a
//! notification back to its queue.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::error::{MqError, Result};
use crate::store::MqStore;

/// Channel id to queue name bindings for one listener instance
pub struct ChannelRegistry {
    store: Arc<dyn MqStore>,
    priority: i32,
    bindings: RwLock<HashMap<String, String>>,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn MqStore>, priority: i32) -> Self {
        Self {
            store,
            priority,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Open the channel for `queue` and record the binding
    ///
    /// Any failure here is a connection error: the listener cannot run
    /// without every registered queue bound.
    #[instrument(skip(self))]
    pub async fn open_channel(&self, queue: &str) -> Result<String> {
        let channel_id = self
            .store
            .open_channel(queue, self.priority)
            .await
            .map_err(|e| {
                MqError::connection(format!("error opening channel for {queue}: {e}"))
            })?;

        let mut bindings = self.bindings.write();
        if let Some(existing) = bindings.get(&channel_id) {
            return Err(MqError::connection(format!(
                "channel {channel_id} returned for {queue} is already bound to {existing}"
            )));
        }
        if bindings.values().any(|bound| bound == queue) {
            return Err(MqError::connection(format!(
                "queue {queue} already has an open channel"
            )));
        }
        bindings.insert(channel_id.clone(), queue.to_string());

        info!(channel_id = %channel_id, "Listening for notifications on queue {queue}");
        Ok(channel_id)
    }

    /// Queue bound to a channel, if any
    pub fn resolve(&self, channel_id: &str) -> Option<String> {
        self.bindings.read().get(channel_id).cloned()
    }

    /// Snapshot of `(channel_id, queue)` bindings, ordered by channel id
    pub fn bindings(&self) -> Vec<(String, String)> {
        let mut bindings: Vec<_> = self
            .bindings
            .read()
            .iter()
            .map(|(channel, queue)| (channel.clone(), queue.clone()))
            .collect();
        bindings.sort();
        bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Close every bound channel and reap dead channels, then forget all bindings
    ///
    /// Best effort: each storage call is bounded by `timeout`, and failures are
    /// logged rather than returned. Returns how many bindings were torn down.
    pub async fn close_all(&self, timeout: Duration) -> usize {
        let bindings = self.bindings();

        for (channel_id, queue) in &bindings {
            match tokio::time::timeout(timeout, self.store.close_channel(channel_id)).await {
                Ok(Ok(())) => info!(channel_id = %channel_id, queue = %queue, "Closed channel"),
                Ok(Err(e)) => warn!(channel_id = %channel_id, "Error closing channel: {e}"),
                Err(_) => warn!(
                    channel_id = %channel_id,
                    "{}",
                    MqError::timeout("close_channel", timeout)
                ),
            }

            match tokio::time::timeout(timeout, self.store.close_dead_channels()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error closing dead channels: {e}"),
                Err(_) => warn!(
                    "{}",
                    MqError::timeout("close_dead_channels", timeout)
                ),
            }
        }

        self.bindings.write().clear();
        bindings.len()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("priority", &self.priority)
            .field("bindings", &self.bindings())
            .finish()
    }
}
