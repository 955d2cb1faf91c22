//! RabbitMQ transport built on lapin.
//!
//! Pulls with `basic.get` (manual ack) so exactly one delivery is in flight,
//! acknowledges with `basic.ack` and requeues with `basic.reject(requeue)`.
//! Payloads are JSON; `producer`/`version` headers and the AMQP timestamp
//! become envelope metadata. A body that is not JSON is rejected without
//! requeue and polling continues.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicRejectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Transport;
use crate::config::ConsumerConfig;
use crate::envelope::{Delivery, DeliveryContext, DeliveryInfo, Envelope, Headers, Metadata};
use crate::error::TransportError;

/// Producer recorded when a message carries no `producer` header.
const UNKNOWN_PRODUCER: &str = "unknown";

/// Header RabbitMQ quorum queues use for the delivery count.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Broker-side details kept on each envelope's context.
#[derive(Debug, Clone)]
pub struct AmqpDeliveryContext {
    pub exchange: String,
    pub redelivered: bool,
}

/// Transport bound to one RabbitMQ queue.
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    queue: String,
    poll_interval: Duration,
}

impl AmqpTransport {
    /// Connect, declare the queue, and bind its routing keys.
    pub async fn connect(config: &ConsumerConfig) -> Result<Self, TransportError> {
        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connection {
                uri: config.redacted_uri(),
                reason: e.to_string(),
            })?;
        let channel = connection.create_channel().await?;

        let binding = &config.binding;
        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        if !binding.routing_keys.is_empty() {
            channel
                .exchange_declare(
                    &binding.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            for key in &binding.routing_keys {
                channel
                    .queue_bind(
                        &binding.queue,
                        &binding.exchange,
                        key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        info!(
            broker = %config.redacted_uri(),
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_keys = ?binding.routing_keys,
            "Connected to AMQP broker"
        );

        Ok(Self {
            connection,
            channel,
            queue: binding.queue.clone(),
            poll_interval: config.poll_interval,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Reject an undecodable delivery without requeue so it cannot come back.
    async fn discard(&self, delivery_tag: u64, reason: &TransportError) -> Result<(), TransportError> {
        warn!(
            delivery_tag,
            queue = %self.queue,
            error = %reason,
            "Rejecting undecodable delivery"
        );
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| TransportError::Requeue {
                delivery_tag,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn receive_next(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let message = self
                .channel
                .basic_get(&self.queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| TransportError::Receive(e.to_string()))?;

            if let Some(message) = message {
                let delivery = message.delivery;
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(field_table_to_json)
                    .unwrap_or_default();
                let timestamp = (*delivery.properties.timestamp()).map(|t| t as i64);
                let retry_count = retry_count(&headers, delivery.redelivered);
                let context = DeliveryContext::new(AmqpDeliveryContext {
                    exchange: delivery.exchange.as_str().to_string(),
                    redelivered: delivery.redelivered,
                });

                let envelope = match decode_envelope(
                    delivery.delivery_tag,
                    &delivery.data,
                    headers,
                    timestamp,
                    delivery.routing_key.as_str(),
                    context,
                ) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        self.discard(delivery.delivery_tag, &e).await?;
                        continue;
                    }
                };
                debug!(
                    delivery_tag = delivery.delivery_tag,
                    routing_key = %envelope.routing_key(),
                    retry_count,
                    "Received AMQP delivery"
                );
                return Ok(Some(Delivery::new(
                    envelope,
                    DeliveryInfo::new(delivery.delivery_tag, retry_count),
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Acknowledge {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn requeue(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
            .await
            .map_err(|e| TransportError::Requeue {
                delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.channel.close(200, "consumer stopped").await {
            warn!(error = %e, "Failed to close AMQP channel cleanly");
        }
        self.connection.close(200, "consumer stopped").await?;
        info!(queue = %self.queue, "AMQP connection closed");
        Ok(())
    }
}

// ── Decoding ────────────────────────────────────────────────────────

/// Build an envelope from raw AMQP delivery parts, defaulting missing metadata.
pub fn decode_envelope(
    delivery_tag: u64,
    body: &[u8],
    mut headers: BTreeMap<String, serde_json::Value>,
    timestamp: Option<i64>,
    routing_key: &str,
    context: DeliveryContext,
) -> Result<Envelope, TransportError> {
    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| TransportError::Decode {
            delivery_tag,
            reason: e.to_string(),
        })?;

    let producer = headers
        .remove("producer")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_PRODUCER.to_string());
    let version = headers
        .remove("version")
        .and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(crate::envelope::DEFAULT_VERSION);

    let metadata = Metadata {
        headers: Headers {
            producer,
            version,
            extra: headers,
        },
        timestamp: timestamp.unwrap_or_else(|| Utc::now().timestamp()),
        routing_key: routing_key.to_string(),
    };
    Ok(Envelope::new(payload, metadata, context))
}

/// Retry count from `x-delivery-count`, else 1 for a redelivery, else 0.
pub fn retry_count(headers: &BTreeMap<String, serde_json::Value>, redelivered: bool) -> u32 {
    headers
        .get(DELIVERY_COUNT_HEADER)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(u32::from(redelivered))
}

fn field_table_to_json(table: &FieldTable) -> BTreeMap<String, serde_json::Value> {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), amqp_value_to_json(v)))
        .collect()
}

/// Convert an AMQP header value to JSON.
pub fn amqp_value_to_json(value: &AMQPValue) -> serde_json::Value {
    use serde_json::Value;

    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Float(n) => Value::from(*n),
        AMQPValue::Double(n) => Value::from(*n),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(amqp_value_to_json).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(field_table_to_json(table).into_iter().collect()),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}
