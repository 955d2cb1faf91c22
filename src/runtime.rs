//! Consumption loop — pulls one delivery at a time and resolves it.
//!
//! Each cycle:
//! 1. `Transport::receive_next()` — wait for a delivery (or time out)
//! 2. `FilterChain::run()` — pre-checks, may halt or request exit
//! 3. `Consumer::consume()` — business logic, only if every filter passed
//! 4. `OutcomeResolver::resolve()` — acknowledge or requeue, maybe stop
//!
//! The loop stops after a cycle that requested termination, a fatal
//! resolution, a transport error, an external stop signal, or the configured
//! message limit. `run()` returns `false` only when it stopped for a fatal
//! reason.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, LoopControl, Policy};
use crate::envelope::{Delivery, DeliveryInfo, Envelope};
use crate::error::TransportError;
use crate::filter::FilterChain;
use crate::resolver::{BrokerAction, ConsumeOutcome, OutcomeResolver, Resolution};
use crate::transport::Transport;

/// Mutable state for one `run()`.
///
/// Termination is checked after every pull. A pre-set
/// `termination_requested` therefore allows one more pull and resolves the
/// delivery it returns, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopState {
    /// Stop after the current cycle.
    pub termination_requested: bool,
    /// The most recent cycle ended the run as failed.
    pub last_cycle_fatal: bool,
}

/// Counters over the lifetime of a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub halted: u64,
    pub failed: u64,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A filter, the consumer, or the caller asked to stop.
    TerminationRequested,
    /// A delivery resolved with `Abort` or an unrecognized policy.
    FatalResolution,
    /// The broker connection failed.
    TransportFailure,
    /// The [`StopHandle`] was triggered.
    StopSignal,
    /// `max_messages` deliveries were resolved.
    MessageLimit,
}

impl StopReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalResolution | Self::TransportFailure)
    }
}

/// Cloneable external stop signal, observed between cycles.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Drives a [`Consumer`] over a [`Transport`].
pub struct ConsumptionLoop<C, T> {
    consumer: C,
    filters: FilterChain<C>,
    transport: T,
    resolver: OutcomeResolver,
    config: ConsumerConfig,
    stop: StopHandle,
    stats: LoopStats,
    stop_reason: Option<StopReason>,
}

impl<C, T> ConsumptionLoop<C, T>
where
    C: Consumer,
    T: Transport,
{
    /// Create a loop; the consumer's filter chain is captured here.
    pub fn new(consumer: C, transport: T, config: ConsumerConfig) -> Self {
        let filters = consumer.filters();
        Self {
            resolver: OutcomeResolver::new(config.halt_action),
            consumer,
            filters,
            transport,
            config,
            stop: StopHandle::new(),
            stats: LoopStats::default(),
            stop_reason: None,
        }
    }

    /// Replace the stop signal with a shared one.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Why the last `run()` stopped.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Run until stopped. Returns `true` unless a fatal resolution or a
    /// transport error stopped the loop.
    pub async fn run(&mut self) -> bool {
        let mut state = LoopState::default();
        self.run_with_state(&mut state).await
    }

    /// Run with caller-provided state.
    pub async fn run_with_state(&mut self, state: &mut LoopState) -> bool {
        info!(
            consumer = self.consumer.name(),
            transport = self.transport.name(),
            queue = %self.config.binding.queue,
            filters = self.filters.len(),
            "Consumption loop started"
        );

        let mut resolved: u64 = 0;
        let reason = loop {
            let mut requeued = false;

            match self.transport.receive_next(self.config.receive_timeout).await {
                Ok(Some(delivery)) => match self.process(delivery, state).await {
                    Ok(resolution) => {
                        resolved += 1;
                        requeued = resolution.action == BrokerAction::Requeue;
                    }
                    Err(e) => {
                        error!(error = %e, "Broker action failed, stopping loop");
                        state.last_cycle_fatal = true;
                        break StopReason::TransportFailure;
                    }
                },
                Ok(None) => {
                    debug!("No delivery within receive timeout");
                }
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "Skipping delivery the transport could not decode");
                }
                Err(e) => {
                    error!(error = %e, "Receive failed, stopping loop");
                    state.last_cycle_fatal = true;
                    break StopReason::TransportFailure;
                }
            }

            if state.last_cycle_fatal {
                break StopReason::FatalResolution;
            }
            if state.termination_requested {
                break StopReason::TerminationRequested;
            }
            if self.stop.is_stopped() {
                break StopReason::StopSignal;
            }
            if self.config.max_messages.is_some_and(|max| resolved >= max) {
                break StopReason::MessageLimit;
            }

            if requeued && !self.config.requeue_pacing.is_zero() {
                debug!(
                    pacing_ms = self.config.requeue_pacing.as_millis() as u64,
                    "Pacing after requeue"
                );
                tokio::time::sleep(self.config.requeue_pacing).await;
            }
        };

        self.stop_reason = Some(reason);
        let ok = !state.last_cycle_fatal;
        let stats = self.stats;
        if ok {
            info!(
                reason = ?reason,
                received = stats.received,
                acknowledged = stats.acknowledged,
                requeued = stats.requeued,
                "Consumption loop stopped"
            );
        } else {
            warn!(
                reason = ?reason,
                received = stats.received,
                acknowledged = stats.acknowledged,
                requeued = stats.requeued,
                "Consumption loop stopped on a fatal cycle"
            );
        }
        ok
    }

    /// Close the underlying transport.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    /// Run one delivery through filters, consumer, and resolver, then apply
    /// the broker action.
    async fn process(
        &mut self,
        delivery: Delivery,
        state: &mut LoopState,
    ) -> Result<Resolution, TransportError> {
        let Delivery { envelope, info } = delivery;
        self.stats.received += 1;
        debug!(
            delivery_tag = info.delivery_tag,
            routing_key = %envelope.routing_key(),
            retry_count = info.retry_count,
            "Processing delivery"
        );

        let mut control = LoopControl::new();
        let filter_outcome = self.filters.run(&self.consumer, &envelope, &info, &mut control);

        let consume_outcome = if filter_outcome.is_halted() {
            self.stats.halted += 1;
            ConsumeOutcome::Skipped
        } else {
            self.call_consumer(&envelope, &info, &mut control).await
        };
        if matches!(consume_outcome, ConsumeOutcome::Failed(_)) {
            self.stats.failed += 1;
        }

        let resolution = self.resolver.resolve(&filter_outcome, consume_outcome);
        if control.exit_requested() || resolution.terminate {
            state.termination_requested = true;
        }
        state.last_cycle_fatal = resolution.fatal;

        match resolution.action {
            BrokerAction::Acknowledge => {
                self.transport.acknowledge(info.delivery_tag).await?;
                self.stats.acknowledged += 1;
            }
            BrokerAction::Requeue => {
                self.transport.requeue(info.delivery_tag).await?;
                self.stats.requeued += 1;
            }
        }

        debug!(
            delivery_tag = info.delivery_tag,
            action = resolution.action.label(),
            fatal = resolution.fatal,
            exit_requested = control.exit_requested(),
            "Delivery resolved"
        );
        Ok(resolution)
    }

    /// Call `consume`, routing any failure (including a panic) through `on_error`.
    async fn call_consumer(
        &self,
        envelope: &Envelope,
        info: &DeliveryInfo,
        control: &mut LoopControl,
    ) -> ConsumeOutcome {
        let result = AssertUnwindSafe(self.consumer.consume(envelope, info, control))
            .catch_unwind()
            .await;

        let error = match result {
            Ok(Ok(())) => return ConsumeOutcome::Succeeded,
            Ok(Err(e)) => e,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(
                    consumer = self.consumer.name(),
                    delivery_tag = info.delivery_tag,
                    panic = %message,
                    "Consumer panicked"
                );
                anyhow::anyhow!("consumer panicked: {message}")
            }
        };

        let policy = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.consumer.on_error(&error, envelope, info)
        })) {
            Ok(policy) => policy,
            Err(panic) => {
                warn!(
                    consumer = self.consumer.name(),
                    delivery_tag = info.delivery_tag,
                    panic = %panic_message(panic.as_ref()),
                    "on_error panicked, treating policy as unrecognized"
                );
                Policy::Unrecognized
            }
        };

        if policy == Policy::Unrecognized {
            warn!(
                consumer = self.consumer.name(),
                delivery_tag = info.delivery_tag,
                error = %error,
                "Unrecognized error policy, requeueing and stopping loop"
            );
        } else {
            info!(
                consumer = self.consumer.name(),
                delivery_tag = info.delivery_tag,
                policy = policy.label(),
                error = %error,
                "Consumer failed"
            );
        }

        ConsumeOutcome::Failed(policy)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::transport::MemoryBroker;

    /// Consumer whose behaviour is picked by payload flags.
    struct FlagConsumer;

    #[async_trait]
    impl Consumer for FlagConsumer {
        async fn consume(
            &self,
            envelope: &Envelope,
            _info: &DeliveryInfo,
            _control: &mut LoopControl,
        ) -> anyhow::Result<()> {
            if envelope.flag("panic") {
                panic!("boom");
            }
            Ok(())
        }

        fn on_error(&self, error: &anyhow::Error, _: &Envelope, _: &DeliveryInfo) -> Policy {
            if error.to_string().contains("boom") {
                Policy::Requeue
            } else {
                Policy::Abort
            }
        }
    }

    /// Consumer whose `on_error` itself panics.
    struct BrokenPolicyConsumer;

    #[async_trait]
    impl Consumer for BrokenPolicyConsumer {
        async fn consume(
            &self,
            _: &Envelope,
            _: &DeliveryInfo,
            _: &mut LoopControl,
        ) -> anyhow::Result<()> {
            anyhow::bail!("fail")
        }

        fn on_error(&self, _: &anyhow::Error, _: &Envelope, _: &DeliveryInfo) -> Policy {
            panic!("policy lookup exploded")
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::new("test")
            .with_requeue_pacing(Duration::ZERO)
            .with_receive_timeout(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn consumer_panic_is_routed_through_on_error() {
        let broker = MemoryBroker::new();
        broker.inject(json!({"panic": true})).await;
        let mut consumer_loop = ConsumptionLoop::new(FlagConsumer, broker.transport(), config());

        let mut state = LoopState {
            termination_requested: true,
            ..Default::default()
        };
        let ok = consumer_loop.run_with_state(&mut state).await;

        assert!(ok);
        assert_eq!(broker.requeued().await.len(), 1);
        assert_eq!(consumer_loop.stats().failed, 1);
    }

    #[tokio::test]
    async fn on_error_panic_is_fatal() {
        let broker = MemoryBroker::new();
        broker.inject(json!({})).await;
        let mut consumer_loop =
            ConsumptionLoop::new(BrokenPolicyConsumer, broker.transport(), config());

        assert!(!consumer_loop.run().await);
        assert_eq!(broker.requeued().await.len(), 1);
        assert!(broker.acknowledged().await.is_empty());
        assert_eq!(consumer_loop.stop_reason(), Some(StopReason::FatalResolution));
    }

    #[tokio::test]
    async fn preset_termination_runs_one_cycle() {
        let broker = MemoryBroker::new();
        broker.inject(json!({"n": 1})).await;
        broker.inject(json!({"n": 2})).await;
        let mut consumer_loop = ConsumptionLoop::new(FlagConsumer, broker.transport(), config());

        let mut state = LoopState {
            termination_requested: true,
            ..Default::default()
        };
        assert!(consumer_loop.run_with_state(&mut state).await);

        assert_eq!(consumer_loop.stats().received, 1);
        assert_eq!(broker.ready_len().await, 1);
        assert_eq!(
            consumer_loop.stop_reason(),
            Some(StopReason::TerminationRequested)
        );
    }

    #[tokio::test]
    async fn stop_handle_ends_idle_loop() {
        let broker = MemoryBroker::new();
        let mut consumer_loop = ConsumptionLoop::new(FlagConsumer, broker.transport(), config());
        let stop = consumer_loop.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stop.stop();
        });

        assert!(consumer_loop.run().await);
        assert_eq!(consumer_loop.stop_reason(), Some(StopReason::StopSignal));
        assert_eq!(consumer_loop.stats(), LoopStats::default());
    }

    /// Transport that replays a fixed script of receive results.
    struct ScriptedTransport {
        script: VecDeque<Result<Option<Delivery>, TransportError>>,
        acknowledged: Vec<u64>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Option<Delivery>, TransportError>>) -> Self {
            Self {
                script: script.into(),
                acknowledged: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn receive_next(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<Delivery>, TransportError> {
            self.script.pop_front().unwrap_or(Ok(None))
        }

        async fn acknowledge(&mut self, delivery_tag: u64) -> Result<(), TransportError> {
            self.acknowledged.push(delivery_tag);
            Ok(())
        }

        async fn requeue(&mut self, _delivery_tag: u64) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn undecodable_delivery_is_skipped() {
        let good = Delivery::new(
            Envelope::builder(json!({"token": "ok"})).build(),
            DeliveryInfo::new(2, 0),
        );
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Decode {
                delivery_tag: 1,
                reason: "expected value at line 1 column 1".to_string(),
            }),
            Ok(Some(good)),
        ]);
        let mut consumer_loop =
            ConsumptionLoop::new(FlagConsumer, transport, config().with_max_messages(1));

        assert!(consumer_loop.run().await);
        assert_eq!(consumer_loop.stop_reason(), Some(StopReason::MessageLimit));
        assert_eq!(consumer_loop.stats().received, 1);
        assert_eq!(consumer_loop.transport().acknowledged, vec![2]);
    }

    #[tokio::test]
    async fn receive_error_other_than_decode_is_fatal() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Receive(
            "connection reset".to_string(),
        ))]);
        let mut consumer_loop = ConsumptionLoop::new(FlagConsumer, transport, config());

        assert!(!consumer_loop.run().await);
        assert_eq!(consumer_loop.stop_reason(), Some(StopReason::TransportFailure));
    }

    #[tokio::test]
    async fn preset_termination_on_idle_queue_stops_after_one_pull() {
        let broker = MemoryBroker::new();
        let mut consumer_loop = ConsumptionLoop::new(FlagConsumer, broker.transport(), config());

        let mut state = LoopState {
            termination_requested: true,
            ..Default::default()
        };
        assert!(consumer_loop.run_with_state(&mut state).await);

        assert_eq!(consumer_loop.stats().received, 0);
        assert_eq!(
            consumer_loop.stop_reason(),
            Some(StopReason::TerminationRequested)
        );
    }

    #[test]
    fn panic_message_handles_str_and_string() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn stop_reason_fatality() {
        assert!(StopReason::FatalResolution.is_fatal());
        assert!(StopReason::TransportFailure.is_fatal());
        assert!(!StopReason::TerminationRequested.is_fatal());
        assert!(!StopReason::StopSignal.is_fatal());
        assert!(!StopReason::MessageLimit.is_fatal());
    }
}
