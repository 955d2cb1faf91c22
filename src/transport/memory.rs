//! In-process broker for tests and synthetic events.
//!
//! [`MemoryBroker`] is a cloneable handle over one queue. Tests inject
//! events, hand a [`MemoryTransport`] to the loop, and afterwards inspect
//! which delivery tags were acknowledged or requeued.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::Transport;
use crate::envelope::{Delivery, DeliveryInfo, Envelope, EnvelopeBuilder};
use crate::error::TransportError;

/// A broker action recorded by the memory broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    Acknowledged(u64),
    Requeued(u64),
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    envelope: Envelope,
    retry_count: u32,
}

#[derive(Debug, Default)]
struct Faults {
    receive: bool,
    acknowledge: bool,
    requeue: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, QueuedMessage>,
    next_tag: u64,
    events: Vec<BrokerEvent>,
    faults: Faults,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    arrivals: Notify,
}

/// Handle to an in-memory queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport consuming from this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    /// Enqueue a fully built envelope.
    pub async fn publish(&self, envelope: Envelope) {
        {
            let mut state = self.shared.state.lock().await;
            state.ready.push_back(QueuedMessage {
                envelope,
                retry_count: 0,
            });
        }
        self.shared.arrivals.notify_one();
    }

    /// Enqueue a synthetic event with default metadata.
    pub async fn inject(&self, payload: serde_json::Value) {
        self.publish(Envelope::builder(payload).build()).await;
    }

    /// Enqueue a synthetic event built from `builder`.
    pub async fn inject_with(&self, builder: EnvelopeBuilder) {
        self.publish(builder.build()).await;
    }

    /// Every acknowledge/requeue, in order.
    pub async fn events(&self) -> Vec<BrokerEvent> {
        self.shared.state.lock().await.events.clone()
    }

    pub async fn acknowledged(&self) -> Vec<u64> {
        self.events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                BrokerEvent::Acknowledged(tag) => Some(tag),
                BrokerEvent::Requeued(_) => None,
            })
            .collect()
    }

    pub async fn requeued(&self) -> Vec<u64> {
        self.events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                BrokerEvent::Requeued(tag) => Some(tag),
                BrokerEvent::Acknowledged(_) => None,
            })
            .collect()
    }

    /// Messages waiting to be delivered.
    pub async fn ready_len(&self) -> usize {
        self.shared.state.lock().await.ready.len()
    }

    /// Messages delivered but neither acknowledged nor requeued.
    pub async fn unacked_len(&self) -> usize {
        self.shared.state.lock().await.unacked.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.state.lock().await.closed
    }

    /// Make the next receive fail.
    pub async fn fail_next_receive(&self) {
        self.shared.state.lock().await.faults.receive = true;
        self.shared.arrivals.notify_one();
    }

    /// Make the next acknowledge fail.
    pub async fn fail_next_acknowledge(&self) {
        self.shared.state.lock().await.faults.acknowledge = true;
    }

    /// Make the next requeue fail.
    pub async fn fail_next_requeue(&self) {
        self.shared.state.lock().await.faults.requeue = true;
    }

    /// Pop the next ready message, if any, and mark it unacked.
    async fn try_deliver(&self) -> Result<Option<Delivery>, TransportError> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if std::mem::take(&mut state.faults.receive) {
            return Err(TransportError::Receive("injected receive failure".to_string()));
        }

        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery::new(
            message.envelope.clone(),
            DeliveryInfo::new(tag, message.retry_count),
        );
        state.unacked.insert(tag, message);
        Ok(Some(delivery))
    }
}

/// [`Transport`] over a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn receive_next(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.broker.try_deliver().await? {
                debug!(delivery_tag = delivery.info.delivery_tag, "Memory broker delivered message");
                return Ok(Some(delivery));
            }
            let arrived =
                tokio::time::timeout_at(deadline, self.broker.shared.arrivals.notified()).await;
            if arrived.is_err() {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if std::mem::take(&mut state.faults.acknowledge) {
            return Err(TransportError::Acknowledge {
                delivery_tag,
                reason: "injected acknowledge failure".to_string(),
            });
        }
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(TransportError::Acknowledge {
                delivery_tag,
                reason: "unknown delivery tag".to_string(),
            });
        }
        state.events.push(BrokerEvent::Acknowledged(delivery_tag));
        Ok(())
    }

    async fn requeue(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
        {
            let mut state = self.broker.shared.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            if std::mem::take(&mut state.faults.requeue) {
                return Err(TransportError::Requeue {
                    delivery_tag,
                    reason: "injected requeue failure".to_string(),
                });
            }
            let Some(mut message) = state.unacked.remove(&delivery_tag) else {
                return Err(TransportError::Requeue {
                    delivery_tag,
                    reason: "unknown delivery tag".to_string(),
                });
            };
            message.retry_count += 1;
            state.ready.push_front(message);
            state.events.push(BrokerEvent::Requeued(delivery_tag));
        }
        self.broker.shared.arrivals.notify_one();
        Ok(())
    }

    /// Closing returns unacked messages to the queue, like a dropped AMQP channel.
    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock().await;
        let mut unacked: Vec<(u64, QueuedMessage)> = state.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, mut message) in unacked {
            message.retry_count += 1;
            state.ready.push_front(message);
        }
        state.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn delivers_in_order_with_fresh_tags() {
        let broker = MemoryBroker::new();
        broker.inject(json!({"n": 1})).await;
        broker.inject(json!({"n": 2})).await;
        let mut transport = broker.transport();

        let first = transport.receive_next(Duration::ZERO).await.unwrap().unwrap();
        let second = transport.receive_next(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(first.envelope.field("n"), Some(&json!(1)));
        assert_eq!(second.envelope.field("n"), Some(&json!(2)));
        assert_ne!(first.info.delivery_tag, second.info.delivery_tag);
        assert_eq!(broker.unacked_len().await, 2);
    }

    #[tokio::test]
    async fn injected_events_get_default_metadata() {
        let broker = MemoryBroker::new();
        broker.inject(json!({"token": "t2"})).await;
        let delivery = broker
            .transport()
            .receive_next(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delivery.envelope.headers().producer, "test_producer");
        assert_eq!(delivery.envelope.headers().version, 1);
        assert_eq!(delivery.envelope.routing_key(), "test.test");
        assert_eq!(delivery.info.retry_count, 0);
    }

    #[tokio::test]
    async fn empty_queue_times_out() {
        let broker = MemoryBroker::new();
        let result = broker
            .transport()
            .receive_next(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut transport = broker.transport();
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.inject(json!({"late": true})).await;
        });

        let delivery = transport.receive_next(Duration::from_secs(5)).await.unwrap();
        assert!(delivery.is_some_and(|d| d.envelope.flag("late")));
    }

    #[tokio::test]
    async fn acknowledge_removes_message() {
        let broker = MemoryBroker::new();
        broker.inject(json!({})).await;
        let mut transport = broker.transport();
        let delivery = transport.receive_next(Duration::ZERO).await.unwrap().unwrap();

        transport.acknowledge(delivery.info.delivery_tag).await.unwrap();

        assert_eq!(broker.acknowledged().await, vec![delivery.info.delivery_tag]);
        assert_eq!(broker.unacked_len().await, 0);
        assert_eq!(broker.ready_len().await, 0);
    }

    #[tokio::test]
    async fn requeue_redelivers_with_retry_count() {
        let broker = MemoryBroker::new();
        broker.inject(json!({"n": 1})).await;
        broker.inject(json!({"n": 2})).await;
        let mut transport = broker.transport();

        let first = transport.receive_next(Duration::ZERO).await.unwrap().unwrap();
        transport.requeue(first.info.delivery_tag).await.unwrap();

        let again = transport.receive_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.envelope.field("n"), Some(&json!(1)));
        assert_eq!(again.info.retry_count, 1);
        assert!(again.info.is_redelivery());
        assert_ne!(again.info.delivery_tag, first.info.delivery_tag);
        assert_eq!(broker.requeued().await, vec![first.info.delivery_tag]);
    }

    #[tokio::test]
    async fn unknown_tag_is_an_error() {
        let mut transport = MemoryBroker::new().transport();
        assert!(matches!(
            transport.acknowledge(99).await,
            Err(TransportError::Acknowledge { delivery_tag: 99, .. })
        ));
        assert!(matches!(
            transport.requeue(99).await,
            Err(TransportError::Requeue { delivery_tag: 99, .. })
        ));
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let broker = MemoryBroker::new();
        broker.inject(json!({})).await;
        let mut transport = broker.transport();

        broker.fail_next_receive().await;
        assert!(matches!(
            transport.receive_next(Duration::ZERO).await,
            Err(TransportError::Receive(_))
        ));

        let delivery = transport.receive_next(Duration::ZERO).await.unwrap().unwrap();
        broker.fail_next_acknowledge().await;
        assert!(transport.acknowledge(delivery.info.delivery_tag).await.is_err());
        transport.acknowledge(delivery.info.delivery_tag).await.unwrap();
    }

    #[tokio::test]
    async fn close_returns_unacked_and_rejects_further_use() {
        let broker = MemoryBroker::new();
        broker.inject(json!({})).await;
        let mut transport = broker.transport();
        let _delivery = transport.receive_next(Duration::ZERO).await.unwrap().unwrap();

        transport.close().await.unwrap();

        assert!(broker.is_closed().await);
        assert_eq!(broker.ready_len().await, 1);
        assert!(matches!(
            transport.receive_next(Duration::ZERO).await,
            Err(TransportError::Closed)
        ));
    }
}
