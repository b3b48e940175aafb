#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # sesamo-mq
//!
//! Notification-driven message consumption for the Sesamo backend.
//!
//! ## Overview
//!
//! Queues live in PostgreSQL and are managed by the `mq` schema procedures.
//! For each registered queue the listener opens a storage channel, subscribes
//! to it with `LISTEN`, and turns each notification into a typed message for
//! the queue's consumer. The outcome is confirmed with `mq.ack` or rejected
//! with `mq.nack` and a retry window; redelivery scheduling stays with the
//! storage engine.
//!
//! ## Module Organization
//!
//! - [`envelope`] - Two-phase envelope decoding
//! - [`consumer`] - Typed consumer trait and the adapter the listener dispatches to
//! - [`consumers`] - Consumers for the backend's own queues
//! - [`ack`] - Ack/Nack client
//! - [`channels`] - Channel-to-queue bindings
//! - [`store`] - Storage procedures (`MqStore`, PostgreSQL implementation)
//! - [`notify`] - Notification transport (`NotificationSource`, `PgListener` implementation)
//! - [`listener`] - The listener loop and shutdown
//! - [`config`] - Listener configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust
//! use sesamo_mq::ListenerConfig;
//!
//! let config = ListenerConfig::default();
//!
//! assert_eq!(config.failure_retry_after, "5 minutes");
//! assert_eq!(config.ack_failure_retry_after, "1 minute");
//! assert_eq!(config.channel_priority, 1);
//! ```

pub mod ack;
pub mod channels;
pub mod config;
pub mod consumer;
pub mod consumers;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod logging;
pub mod notify;
pub mod store;

pub use ack::AckClient;
pub use channels::ChannelRegistry;
pub use config::ListenerConfig;
pub use consumer::{wrap_consumer, ConsumerAdapter, MessageConsumer, ProcessOutcome, RawConsumer};
pub use envelope::{decode_envelope, Envelope, RawEnvelope};
pub use error::{MqError, Result};
pub use listener::{ListenerState, ListenerStats, MqListener};
pub use notify::{Notification, NotificationSource, PgNotificationSource};
pub use store::{MqStore, PgMqStore};
