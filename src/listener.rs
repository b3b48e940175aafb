//! # Queue notification listener
//!
//! [`MqListener`] binds one storage channel per registered queue, waits for
//! notifications on a dedicated connection and dispatches each one to the
//! consumer registered for its queue. Every delivery that reaches a consumer is
//! resolved with exactly one Ack or Nack; the only double call is the
//! compensating Nack issued when an Ack itself fails.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Opening -> Listening <-> Dispatching -> ShuttingDown -> Stopped
//! ```
//!
//! Dispatch is strictly sequential: one message is in flight at a time, which
//! is also the listener's back-pressure. Scale out by running more listeners
//! over disjoint queue sets.
//!
//! ## Shutdown
//!
//! [`MqListener::shutdown`] cancels the loop, waits until `start` has stopped
//! opening channels, gives the loop a grace period to notice, then closes
//! every bound channel. Opening stops at the first queue not yet bound when
//! cancellation is seen. Cancellation is observed before
//! each wait, inside the wait, and alongside a running consumer. A consumer is
//! never aborted: if cancellation arrives while a delivery is in flight, the
//! loop Nacks that delivery with the failure retry window, lets the consumer
//! finish, and discards its outcome.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = Arc::new(PgMqStore::connect(&config).await?);
//! let source = PgNotificationSource::connect(&config).await?;
//!
//! let mut listener = MqListener::new(store, source, config);
//! listener.register("create_user", CreateUserConsumer::new())?;
//! let listener = Arc::new(listener);
//!
//! let running = tokio::spawn({
//!     let listener = Arc::clone(&listener);
//!     async move { listener.start().await }
//! });
//!
//! // ... on SIGTERM
//! listener.shutdown().await?;
//! running.await??;
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::ack::AckClient;
use crate::channels::ChannelRegistry;
use crate::config::ListenerConfig;
use crate::consumer::{wrap_consumer, MessageConsumer, ProcessOutcome, RawConsumer};
use crate::envelope::RawEnvelope;
use crate::error::{MqError, Result};
use crate::notify::{Notification, NotificationSource};
use crate::store::MqStore;

/// Lifecycle state of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Idle = 0,
    Opening = 1,
    Listening = 2,
    Dispatching = 3,
    ShuttingDown = 4,
    Stopped = 5,
}

impl ListenerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Opening,
            2 => Self::Listening,
            3 => Self::Dispatching,
            4 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Delivery currently handed to a consumer
///
/// One atomic slot; `IDLE` means nothing is in flight. Whoever takes the slot
/// owns the resolution of that delivery.
#[derive(Debug)]
struct InFlight(AtomicI64);

impl InFlight {
    const IDLE: i64 = i64::MIN;

    fn new() -> Self {
        Self(AtomicI64::new(Self::IDLE))
    }

    fn mark(&self, delivery_id: i64) {
        self.0.store(delivery_id, Ordering::SeqCst);
    }

    fn take(&self) -> Option<i64> {
        match self.0.swap(Self::IDLE, Ordering::SeqCst) {
            Self::IDLE => None,
            delivery_id => Some(delivery_id),
        }
    }

    fn current(&self) -> Option<i64> {
        match self.0.load(Ordering::SeqCst) {
            Self::IDLE => None,
            delivery_id => Some(delivery_id),
        }
    }
}

/// Statistics about the listener
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub notifications_received: u64,
    pub unbound_notifications: u64,
    pub decode_errors: u64,
    pub consumer_failures: u64,
    pub acks: u64,
    pub nacks: u64,
    pub ack_failures: u64,
    pub nack_failures: u64,
    pub last_notification_at: Option<DateTime<Utc>>,
}

/// Notification listener dispatching queue messages to registered consumers
pub struct MqListener {
    config: ListenerConfig,
    consumers: HashMap<String, Arc<dyn RawConsumer>>,
    channels: ChannelRegistry,
    acks: AckClient,
    source: Mutex<Option<Box<dyn NotificationSource>>>,
    cancel: CancellationToken,
    /// Flips to true once no further channel can be opened by `start`
    opening_done: watch::Sender<bool>,
    in_flight: InFlight,
    state: AtomicU8,
    cleaned_up: AtomicBool,
    stats: RwLock<ListenerStats>,
}

impl MqListener {
    /// Create a listener
    ///
    /// `store` serves Ack/Nack and channel management; `source` must be a
    /// separate connection used only for waiting on notifications.
    pub fn new<S>(store: Arc<dyn MqStore>, source: S, config: ListenerConfig) -> Self
    where
        S: NotificationSource + 'static,
    {
        Self {
            channels: ChannelRegistry::new(Arc::clone(&store), config.channel_priority),
            acks: AckClient::new(store),
            consumers: HashMap::new(),
            source: Mutex::new(Some(Box::new(source))),
            cancel: CancellationToken::new(),
            opening_done: watch::Sender::new(false),
            in_flight: InFlight::new(),
            state: AtomicU8::new(ListenerState::Idle as u8),
            cleaned_up: AtomicBool::new(false),
            stats: RwLock::new(ListenerStats::default()),
            config,
        }
    }

    /// Register the consumer for a queue; only allowed before `start`
    pub fn register_consumer<S: Into<String>>(
        &mut self,
        queue: S,
        consumer: Arc<dyn RawConsumer>,
    ) -> Result<&mut Self> {
        let queue = queue.into();

        if self.state() != ListenerState::Idle {
            return Err(MqError::config(format!(
                "cannot register consumer for {queue}: listener already started"
            )));
        }
        if queue.trim().is_empty() {
            return Err(MqError::config("queue name must not be empty"));
        }
        if self.consumers.contains_key(&queue) {
            return Err(MqError::config(format!(
                "a consumer is already registered for queue {queue}"
            )));
        }

        debug!(queue = %queue, "Registered consumer");
        self.consumers.insert(queue, consumer);
        Ok(self)
    }

    /// Register a typed consumer, wrapping it for `T` bodies
    pub fn register<T, C, S>(&mut self, queue: S, consumer: C) -> Result<&mut Self>
    where
        T: DeserializeOwned + Send + 'static,
        C: MessageConsumer<T> + 'static,
        S: Into<String>,
    {
        self.register_consumer(queue, wrap_consumer::<T, C>(consumer))
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// `(channel_id, queue)` pairs currently bound
    pub fn channel_bindings(&self) -> Vec<(String, String)> {
        self.channels.bindings()
    }

    /// Delivery id currently being processed, if any
    pub fn in_flight(&self) -> Option<i64> {
        self.in_flight.current()
    }

    /// Registered queue names, sorted
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self.consumers.keys().cloned().collect();
        queues.sort();
        queues
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Bind channels and run the listener loop until shutdown
    ///
    /// Returns `Ok(())` after a shutdown. Fails with a configuration error when
    /// no consumer is registered or the listener was already started, and with
    /// a connection error when a channel cannot be opened or the notification
    /// connection fails.
    pub async fn start(&self) -> Result<()> {
        if self.consumers.is_empty() {
            return Err(MqError::config(
                "no consumers registered, nothing to listen for",
            ));
        }

        self.state
            .compare_exchange(
                ListenerState::Idle as u8,
                ListenerState::Opening as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| MqError::config("listener already started"))?;

        let source = self.source.lock().take();
        let result = match source {
            Some(mut source) => self.open_and_run(source.as_mut()).await,
            None => Err(MqError::config("notification source already consumed")),
        };
        self.opening_done.send_replace(true);

        self.set_state(ListenerState::Stopped);
        info!("MQ listener main loop exited");

        match result {
            Err(MqError::Cancelled) => {
                info!("MQ listener shut down successfully");
                Ok(())
            }
            other => other,
        }
    }

    async fn open_and_run(&self, source: &mut dyn NotificationSource) -> Result<()> {
        let opened = self.open_channels(source).await;
        self.opening_done.send_replace(true);
        opened?;

        info!(
            channels = self.channels.len(),
            "PostgreSQL notification listener started"
        );
        self.run(source).await
    }

    /// Bind every registered queue, stopping early once shutdown was requested
    async fn open_channels(&self, source: &mut dyn NotificationSource) -> Result<()> {
        for queue in self.queues() {
            if self.cancel.is_cancelled() {
                info!(queue = %queue, "Shutdown requested while opening channels");
                return Err(MqError::Cancelled);
            }
            let channel_id = self.channels.open_channel(&queue).await?;
            source.listen(&channel_id).await?;
        }
        Ok(())
    }

    async fn run(&self, source: &mut dyn NotificationSource) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return self.shutdown_loop().await;
            }

            self.set_state(ListenerState::Listening);

            let notification = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.shutdown_loop().await,
                received = source.recv() => match received {
                    Ok(notification) => notification,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => return Err(MqError::connection(e.to_string())),
                },
            };

            self.dispatch(notification).await;
        }
    }

    /// Handle one notification end to end
    #[instrument(skip(self, notification), fields(channel = %notification.channel))]
    async fn dispatch(&self, notification: Notification) {
        self.record(|stats| {
            stats.notifications_received += 1;
            stats.last_notification_at = Some(Utc::now());
        });
        debug!("Received notification");

        let Some(queue) = self.channels.resolve(&notification.channel) else {
            self.record(|stats| stats.unbound_notifications += 1);
            info!("No queue bound to channel, skipping");
            return;
        };
        let Some(consumer) = self.consumers.get(&queue).cloned() else {
            self.record(|stats| stats.unbound_notifications += 1);
            info!(queue = %queue, "No consumer registered for queue, skipping");
            return;
        };

        let envelope = match RawEnvelope::parse(&notification.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // No delivery id to resolve; the storage visibility timeout takes over
                self.record(|stats| stats.decode_errors += 1);
                error!(queue = %queue, "Dropping undecodable notification: {e}");
                return;
            }
        };

        let delivery_id = envelope.delivery_id;
        self.in_flight.mark(delivery_id);
        self.set_state(ListenerState::Dispatching);

        let processing = consumer.process_raw(envelope);
        tokio::pin!(processing);

        let outcome = tokio::select! {
            biased;
            outcome = &mut processing => outcome,
            _ = self.cancel.cancelled() => {
                self.nack_in_flight().await;
                processing.await
            }
        };

        if self.in_flight.take().is_none() {
            info!(
                delivery_id,
                success = outcome.is_success(),
                "Delivery already nacked during shutdown, discarding outcome"
            );
            return;
        }

        self.resolve(&queue, outcome).await;
    }

    /// Turn a consumer outcome into exactly one terminal storage call
    async fn resolve(&self, queue: &str, outcome: ProcessOutcome) {
        let delivery_id = outcome.delivery_id;

        match outcome.result {
            Ok(()) => match self.acks.ack(delivery_id).await {
                Ok(()) => {
                    self.record(|stats| stats.acks += 1);
                    info!(queue = %queue, delivery_id, "Message acknowledged");
                }
                Err(e) => {
                    self.record(|stats| stats.ack_failures += 1);
                    error!(queue = %queue, delivery_id, "Error acknowledging message: {e}");
                    let retry_after = self.config.ack_failure_retry_after.clone();
                    self.nack(delivery_id, &retry_after).await;
                }
            },
            Err(e) => {
                let malformed = matches!(e, MqError::Decode { .. });
                self.record(|stats| {
                    if malformed {
                        stats.decode_errors += 1;
                    } else {
                        stats.consumer_failures += 1;
                    }
                });

                if delivery_id > 0 {
                    warn!(queue = %queue, delivery_id, "Error processing message: {e}");
                    let retry_after = self.config.failure_retry_after.clone();
                    self.nack(delivery_id, &retry_after).await;
                } else {
                    error!(
                        queue = %queue,
                        delivery_id,
                        "Error processing message without a usable delivery id: {e}"
                    );
                }
            }
        }
    }

    async fn nack(&self, delivery_id: i64, retry_after: &str) {
        match self.acks.nack(delivery_id, retry_after).await {
            Ok(()) => {
                self.record(|stats| stats.nacks += 1);
                info!(delivery_id, retry_after, "Message nacked");
            }
            Err(e) => {
                self.record(|stats| stats.nack_failures += 1);
                error!(delivery_id, retry_after, "Error sending NACK: {e}");
            }
        }
    }

    /// Claim the in-flight delivery and Nack it with the failure window
    async fn nack_in_flight(&self) {
        if let Some(delivery_id) = self.in_flight.take() {
            if delivery_id > 0 {
                info!(delivery_id, "Sending NACK for in-progress message");
                let retry_after = self.config.failure_retry_after.clone();
                self.nack(delivery_id, &retry_after).await;
            }
        }
    }

    async fn shutdown_loop(&self) -> Result<()> {
        self.set_state(ListenerState::ShuttingDown);
        info!("MQ listener shutdown signal received");
        self.nack_in_flight().await;
        Err(MqError::Cancelled)
    }

    /// Stop the loop and tear down every bound channel
    ///
    /// Before `start` this only marks the listener cancelled, so a later
    /// `start` returns without opening anything; no storage call is made.
    /// After a completed shutdown it is a no-op. Cleanup waits until `start`
    /// can no longer open channels, then closes every binding best effort;
    /// failures are logged.
    pub async fn shutdown(&self) -> Result<()> {
        // Cancel before reading the state: a concurrent `start` either shows up
        // as non-idle here or sees the cancellation before its first open
        self.cancel.cancel();

        if self.state() == ListenerState::Idle {
            info!("MqListener is not running, nothing to shut down");
            return Ok(());
        }
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!("MqListener already shut down");
            return Ok(());
        }

        info!("Gracefully shutting down MQ listener...");

        let mut opening = self.opening_done.subscribe();
        if opening.wait_for(|done| *done).await.is_err() {
            warn!("Lost track of channel opening, closing the channels bound so far");
        }

        if self.state() != ListenerState::Stopped {
            tokio::time::sleep(self.config.shutdown_grace_period()).await;
        }

        info!("Closing channels...");
        let closed = self.channels.close_all(self.config.cleanup_timeout()).await;

        info!(channels = closed, "MQ listener cleanup process completed");
        Ok(())
    }

    fn record(&self, update: impl FnOnce(&mut ListenerStats)) {
        update(&mut self.stats.write());
    }
}

impl std::fmt::Debug for MqListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqListener")
            .field("state", &self.state())
            .field("queues", &self.queues())
            .field("channels", &self.channels)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
