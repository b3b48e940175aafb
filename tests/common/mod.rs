//! In-memory test doubles for listener integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use sesamo_mq::{
    Envelope, ListenerConfig, MessageConsumer, MqError, MqListener, MqStore, Notification,
    NotificationSource, ProcessOutcome, Result,
};

pub const LONG_WINDOW: &str = "5 minutes";
pub const SHORT_WINDOW: &str = "1 minute";

/// One call made against the storage engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    OpenChannel { queue: String, priority: i32 },
    CloseChannel(String),
    CloseDeadChannels,
    Ack(i64),
    Nack(i64, String),
}

/// [`MqStore`] that records every call and can be told to fail
#[derive(Debug)]
pub struct RecordingStore {
    calls: Mutex<Vec<StoreCall>>,
    next_channel: AtomicU64,
    pub fail_open: AtomicBool,
    pub fail_ack: AtomicBool,
    pub fail_nack: AtomicBool,
    pub fail_cleanup: AtomicBool,
    /// Delay before each `open_channel` answers, in milliseconds
    pub open_delay_ms: AtomicU64,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_channel: AtomicU64::new(100),
            fail_open: AtomicBool::new(false),
            fail_ack: AtomicBool::new(false),
            fail_nack: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            open_delay_ms: AtomicU64::new(0),
        }
    }
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub fn acks(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::Ack(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn nacks(&self) -> Vec<(i64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::Nack(id, retry_after) => Some((id, retry_after)),
                _ => None,
            })
            .collect()
    }

    pub fn opened(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::OpenChannel { queue, .. } => Some(queue),
                _ => None,
            })
            .collect()
    }

    /// Channel ids passed to close_channel
    pub fn closed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::CloseChannel(channel_id) => Some(channel_id),
                _ => None,
            })
            .collect()
    }

    /// close_channel and close_dead_channels calls
    pub fn cleanup_calls(&self) -> Vec<StoreCall> {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(
                    call,
                    StoreCall::CloseChannel(_) | StoreCall::CloseDeadChannels
                )
            })
            .collect()
    }

    fn push(&self, call: StoreCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MqStore for RecordingStore {
    async fn open_channel(&self, queue_name: &str, priority: i32) -> Result<String> {
        self.push(StoreCall::OpenChannel {
            queue: queue_name.to_string(),
            priority,
        });
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(MqError::connection("function mq.open_channel does not exist"));
        }
        Ok(self.next_channel.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn close_channel(&self, channel_id: &str) -> Result<()> {
        self.push(StoreCall::CloseChannel(channel_id.to_string()));
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(MqError::connection("connection reset by peer"));
        }
        Ok(())
    }

    async fn close_dead_channels(&self) -> Result<()> {
        self.push(StoreCall::CloseDeadChannels);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(MqError::connection("connection reset by peer"));
        }
        Ok(())
    }

    async fn ack(&self, delivery_id: i64) -> Result<()> {
        self.push(StoreCall::Ack(delivery_id));
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(MqError::connection("canceling statement due to statement timeout"));
        }
        Ok(())
    }

    async fn nack(&self, delivery_id: i64, retry_after: &str) -> Result<()> {
        self.push(StoreCall::Nack(delivery_id, retry_after.to_string()));
        if self.fail_nack.load(Ordering::SeqCst) {
            return Err(MqError::connection("canceling statement due to statement timeout"));
        }
        Ok(())
    }
}

/// [`NotificationSource`] fed through an mpsc channel
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Notification>>,
    listened: Arc<Mutex<Vec<String>>>,
}

/// Test-side handle for pushing notifications into a [`ChannelSource`]
#[derive(Clone)]
pub struct NotificationFeed {
    tx: mpsc::UnboundedSender<Result<Notification>>,
    listened: Arc<Mutex<Vec<String>>>,
}

pub fn notification_source() -> (ChannelSource, NotificationFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listened = Arc::new(Mutex::new(Vec::new()));
    (
        ChannelSource {
            rx,
            listened: Arc::clone(&listened),
        },
        NotificationFeed { tx, listened },
    )
}

impl NotificationFeed {
    /// Channels the listener subscribed to, in order
    pub fn listened(&self) -> Vec<String> {
        self.listened.lock().clone()
    }

    pub fn notify(&self, channel: &str, payload: impl Into<String>) {
        let _ = self.tx.send(Ok(Notification::new(channel, payload)));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(MqError::connection(message)));
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.listened.lock().push(channel.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification> {
        match self.rx.recv().await {
            Some(received) => received,
            None => Err(MqError::connection("notification connection closed")),
        }
    }
}

/// Consumer that returns a fixed outcome for every message
pub struct ScriptedConsumer {
    delivery_id: Option<i64>,
    fail: bool,
    pub seen: Mutex<Vec<Envelope<Value>>>,
}

impl ScriptedConsumer {
    /// Succeed with the envelope's delivery id
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            delivery_id: None,
            fail: false,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Fail with the envelope's delivery id
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            delivery_id: None,
            fail: true,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Fail reporting a specific delivery id
    pub fn failing_with(delivery_id: i64) -> Arc<Self> {
        Arc::new(Self {
            delivery_id: Some(delivery_id),
            fail: true,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl MessageConsumer<Value> for ScriptedConsumer {
    async fn process(&self, message: Envelope<Value>) -> ProcessOutcome {
        let delivery_id = self.delivery_id.unwrap_or(message.delivery_id);
        self.seen.lock().push(message);
        if self.fail {
            return ProcessOutcome::failure(
                delivery_id,
                MqError::consumer(anyhow::anyhow!("downstream service unavailable")),
            );
        }
        ProcessOutcome::success(delivery_id)
    }
}

/// Consumer that blocks until released, to hold a delivery in flight
#[derive(Default)]
pub struct GatedConsumer {
    pub entered: Notify,
    pub release: Notify,
}

#[async_trait]
impl MessageConsumer<Value> for GatedConsumer {
    async fn process(&self, message: Envelope<Value>) -> ProcessOutcome {
        self.entered.notify_one();
        self.release.notified().await;
        ProcessOutcome::success(message.delivery_id)
    }
}

pub fn test_config() -> ListenerConfig {
    ListenerConfig::new()
        .with_shutdown_grace_period(Duration::from_millis(50))
        .with_cleanup_timeout(Duration::from_millis(200))
}

pub fn payload(delivery_id: i64, routing_key: &str, body: Value) -> String {
    json!({
        "delivery_id": delivery_id,
        "routing_key": routing_key,
        "headers": {},
        "body": body,
    })
    .to_string()
}

/// Channel id bound to `queue`
pub fn channel_for(listener: &MqListener, queue: &str) -> String {
    listener
        .channel_bindings()
        .into_iter()
        .find(|(_, bound)| bound == queue)
        .map(|(channel, _)| channel)
        .unwrap_or_else(|| panic!("no channel bound for {queue}"))
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
