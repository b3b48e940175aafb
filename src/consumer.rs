//! # Consumer adapter
//!
//! Consumers are written against a concrete body type through
//! [`MessageConsumer<T>`]. The listener only ever sees [`RawConsumer`], which
//! [`ConsumerAdapter`] implements by finishing the envelope decode with `T` and
//! forwarding to the typed consumer. This keeps a heterogeneous set of
//! consumers behind one trait object per queue.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::envelope::{Envelope, RawEnvelope};
use crate::error::{MqError, Result};

/// Result of processing one message: the delivery id to resolve and whether
/// processing succeeded
#[derive(Debug)]
pub struct ProcessOutcome {
    pub delivery_id: i64,
    pub result: Result<()>,
}

impl ProcessOutcome {
    /// Processing succeeded; the delivery should be acknowledged
    pub fn success(delivery_id: i64) -> Self {
        Self {
            delivery_id,
            result: Ok(()),
        }
    }

    /// Processing failed; the delivery should be retried later
    pub fn failure(delivery_id: i64, error: MqError) -> Self {
        Self {
            delivery_id,
            result: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Strongly typed message processor bound to one queue
#[async_trait]
pub trait MessageConsumer<T: Send + 'static>: Send + Sync {
    /// Process one message and report which delivery it resolves
    async fn process(&self, message: Envelope<T>) -> ProcessOutcome;
}

#[async_trait]
impl<T, C> MessageConsumer<T> for Arc<C>
where
    T: Send + 'static,
    C: MessageConsumer<T> + ?Sized,
{
    async fn process(&self, message: Envelope<T>) -> ProcessOutcome {
        (**self).process(message).await
    }
}

/// Body-agnostic processing capability held by the listener
#[async_trait]
pub trait RawConsumer: Send + Sync {
    /// Decode the body of an already parsed envelope and process it
    async fn process_raw(&self, envelope: RawEnvelope) -> ProcessOutcome;
}

/// Adapts a [`MessageConsumer<T>`] into a [`RawConsumer`]
pub struct ConsumerAdapter<T, C> {
    consumer: C,
    _body: PhantomData<fn() -> T>,
}

impl<T, C> ConsumerAdapter<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: MessageConsumer<T>,
{
    pub fn new(consumer: C) -> Self {
        Self {
            consumer,
            _body: PhantomData,
        }
    }
}

#[async_trait]
impl<T, C> RawConsumer for ConsumerAdapter<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: MessageConsumer<T>,
{
    async fn process_raw(&self, envelope: RawEnvelope) -> ProcessOutcome {
        let delivery_id = envelope.delivery_id;
        match envelope.decode::<T>() {
            Ok(message) => self.consumer.process(message).await,
            Err(error) => ProcessOutcome::failure(delivery_id, error),
        }
    }
}

/// Wrap a typed consumer for registration on a listener
pub fn wrap_consumer<T, C>(consumer: C) -> Arc<dyn RawConsumer>
where
    T: DeserializeOwned + Send + 'static,
    C: MessageConsumer<T> + 'static,
{
    Arc::new(ConsumerAdapter::<T, C>::new(consumer))
}
