//! Envelope and delivery types handed to consumers.
//!
//! An [`Envelope`] is the decoded payload plus metadata for one delivery.
//! [`DeliveryInfo`] carries the broker-side facts (delivery tag, retry count)
//! the loop needs to acknowledge or requeue it. Both are immutable once built
//! and live for exactly one consumption cycle.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Producer name filled into synthetic envelopes.
pub const DEFAULT_PRODUCER: &str = "test_producer";

/// Schema version filled into synthetic envelopes.
pub const DEFAULT_VERSION: u32 = 1;

/// Routing key filled into synthetic envelopes.
pub const DEFAULT_ROUTING_KEY: &str = "test.test";

// ── Metadata ────────────────────────────────────────────────────────

/// Message headers. `producer` and `version` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// Name of the service that produced the event.
    pub producer: String,
    /// Schema version of the payload.
    pub version: u32,
    /// Any further headers, kept as JSON values.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Headers {
    pub fn new(producer: impl Into<String>, version: u32) -> Self {
        Self {
            producer: producer.into(),
            version,
            extra: BTreeMap::new(),
        }
    }

    /// Look up a non-standard header.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }
}

/// Fully populated delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub headers: Headers,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub routing_key: String,
}

impl Metadata {
    /// The timestamp as a UTC datetime (epoch on out-of-range values).
    pub fn produced_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp, 0).unwrap_or_default()
    }
}

// ── Transport context ───────────────────────────────────────────────

/// Opaque transport handle attached to an envelope.
///
/// The loop never looks inside; a transport may stash whatever it needs and
/// get it back with [`DeliveryContext::downcast_ref`].
#[derive(Clone, Default)]
pub struct DeliveryContext(Option<Arc<dyn Any + Send + Sync>>);

impl DeliveryContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("DeliveryContext(..)"),
            None => f.write_str("DeliveryContext(empty)"),
        }
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// Decoded message plus metadata for one delivery.
#[derive(Debug, Clone)]
pub struct Envelope {
    payload: serde_json::Value,
    metadata: Metadata,
    context: DeliveryContext,
}

impl Envelope {
    /// Build an envelope from already-populated metadata.
    pub fn new(payload: serde_json::Value, metadata: Metadata, context: DeliveryContext) -> Self {
        Self {
            payload,
            metadata,
            context,
        }
    }

    /// Start a synthetic envelope; unset metadata gets the test defaults.
    pub fn builder(payload: serde_json::Value) -> EnvelopeBuilder {
        EnvelopeBuilder::new(payload)
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserialize the payload into a typed event.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Look up a top-level payload field.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// True when a top-level payload field is JSON `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.field(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn headers(&self) -> &Headers {
        &self.metadata.headers
    }

    pub fn routing_key(&self) -> &str {
        &self.metadata.routing_key
    }

    pub fn timestamp(&self) -> i64 {
        self.metadata.timestamp
    }

    pub fn context(&self) -> &DeliveryContext {
        &self.context
    }
}

/// Builder for synthetic envelopes.
///
/// Anything left unset is defaulted on [`build`](Self::build): producer
/// `test_producer`, version `1`, timestamp now, routing key `test.test`.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    payload: serde_json::Value,
    producer: Option<String>,
    version: Option<u32>,
    timestamp: Option<i64>,
    routing_key: Option<String>,
    extra: BTreeMap<String, serde_json::Value>,
    context: DeliveryContext,
}

impl EnvelopeBuilder {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            producer: None,
            version: None,
            timestamp: None,
            routing_key: None,
            extra: BTreeMap::new(),
            context: DeliveryContext::empty(),
        }
    }

    pub fn producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn context(mut self, context: DeliveryContext) -> Self {
        self.context = context;
        self
    }

    pub fn build(self) -> Envelope {
        let headers = Headers {
            producer: self
                .producer
                .unwrap_or_else(|| DEFAULT_PRODUCER.to_string()),
            version: self.version.unwrap_or(DEFAULT_VERSION),
            extra: self.extra,
        };
        let metadata = Metadata {
            headers,
            timestamp: self.timestamp.unwrap_or_else(|| Utc::now().timestamp()),
            routing_key: self
                .routing_key
                .unwrap_or_else(|| DEFAULT_ROUTING_KEY.to_string()),
        };
        Envelope::new(self.payload, metadata, self.context)
    }
}

// ── Delivery info ───────────────────────────────────────────────────

/// Broker-side facts about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Identifier used to acknowledge or requeue this delivery.
    pub delivery_tag: u64,
    /// How many times this message was delivered before.
    pub retry_count: u32,
}

impl DeliveryInfo {
    pub fn new(delivery_tag: u64, retry_count: u32) -> Self {
        Self {
            delivery_tag,
            retry_count,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.retry_count > 0
    }
}

/// An envelope paired with its delivery info, as pulled from a transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub info: DeliveryInfo,
}

impl Delivery {
    pub fn new(envelope: Envelope, info: DeliveryInfo) -> Self {
        Self { envelope, info }
    }
}
