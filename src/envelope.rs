//! # Envelope codec
//!
//! Notification payloads carry a generic envelope around a consumer-specific
//! body:
//!
//! ```text
//! { "delivery_id": 7, "routing_key": "create_user", "headers": {}, "body": { ... } }
//! ```
//!
//! Decoding happens in two phases. [`RawEnvelope::parse`] reads the outer
//! structure and keeps the body as an unparsed JSON segment; [`RawEnvelope::decode`]
//! parses that segment into the body type declared by the consumer. A malformed
//! body therefore still yields the delivery id, so the message can be Nacked.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{MqError, Result};

/// A decoded message with a typed body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub delivery_id: i64,
    pub routing_key: String,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    pub body: T,
    /// Original notification payload, kept for diagnostics
    #[serde(skip)]
    pub raw_payload: Vec<u8>,
}

impl<T> Envelope<T> {
    pub fn new<S: Into<String>>(delivery_id: i64, routing_key: S, body: T) -> Self {
        Self {
            delivery_id,
            routing_key: routing_key.into(),
            headers: HashMap::new(),
            body,
            raw_payload: Vec::new(),
        }
    }

    pub fn with_header<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// The original payload as text, if it was valid UTF-8
    pub fn raw_payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw_payload).ok()
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encode to the notification wire format
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| MqError::decode(Some(self.delivery_id), format!("encode failed: {e}")))
    }
}

/// Outer envelope with the body left as raw JSON
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    #[serde(default)]
    pub delivery_id: i64,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    headers: Option<HashMap<String, Value>>,
    #[serde(default)]
    body: Option<Box<RawValue>>,
    #[serde(skip)]
    raw_payload: Vec<u8>,
}

impl RawEnvelope {
    /// Phase one: parse the outer structure of a notification payload
    ///
    /// Failure carries no delivery id since none could be read.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut envelope: RawEnvelope = serde_json::from_str(payload)
            .map_err(|e| MqError::decode(None, format!("error parsing message payload: {e}")))?;
        envelope.raw_payload = payload.as_bytes().to_vec();
        Ok(envelope)
    }

    /// The body segment exactly as it appeared in the payload
    pub fn raw_body(&self) -> &str {
        self.body.as_deref().map(RawValue::get).unwrap_or("null")
    }

    pub fn headers(&self) -> Option<&HashMap<String, Value>> {
        self.headers.as_ref()
    }

    /// Phase two: parse the body into the consumer's declared type
    ///
    /// Failure keeps the delivery id recovered in phase one.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Envelope<T>> {
        let body: T = serde_json::from_str(self.raw_body()).map_err(|e| {
            MqError::decode(
                Some(self.delivery_id),
                format!("error unmarshaling message body: {e}"),
            )
        })?;

        Ok(Envelope {
            delivery_id: self.delivery_id,
            routing_key: self.routing_key,
            headers: self.headers.unwrap_or_default(),
            body,
            raw_payload: self.raw_payload,
        })
    }
}

/// Decode a payload in both phases
pub fn decode_envelope<T: DeserializeOwned>(payload: &str) -> Result<Envelope<T>> {
    RawEnvelope::parse(payload)?.decode()
}
