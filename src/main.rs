use tracing::{info, warn};

use hophop::filter::topic_regex;
use hophop::transport::AmqpTransport;
use hophop::{
    ConfigError, Consumer, ConsumerConfig, ConsumptionLoop, DeliveryInfo, Envelope, FilterChain,
    LoopControl, Policy,
};

/// Logs every event it receives. Used to tail a queue from the command line.
struct LogConsumer {
    /// AMQP topic pattern; deliveries whose routing key does not match are skipped.
    routing_filter: Option<String>,
}

#[async_trait::async_trait]
impl Consumer for LogConsumer {
    fn name(&self) -> &str {
        "log"
    }

    fn filters(&self) -> FilterChain<Self> {
        let mut chain = FilterChain::new();
        if let Some(pattern) = &self.routing_filter {
            if let Err(e) = chain.add_routing_key(pattern) {
                warn!(pattern = %pattern, error = %e, "Ignoring invalid routing filter");
            }
        }
        chain
    }

    async fn consume(
        &self,
        envelope: &Envelope,
        info: &DeliveryInfo,
        _control: &mut LoopControl,
    ) -> anyhow::Result<()> {
        info!(
            routing_key = %envelope.routing_key(),
            producer = %envelope.headers().producer,
            version = envelope.headers().version,
            timestamp = envelope.timestamp(),
            retry_count = info.retry_count,
            payload = %envelope.payload(),
            "Event received"
        );
        Ok(())
    }

    fn on_error(&self, _error: &anyhow::Error, _: &Envelope, _: &DeliveryInfo) -> Policy {
        Policy::Requeue
    }
}

/// Log to stderr, or to a daily rolling file under `HOPHOP_LOG_DIR`.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("HOPHOP_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hophop.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> hophop::Result<()> {
    let _log_guard = init_tracing();

    let config = ConsumerConfig::from_env()?;
    let routing_filter = match std::env::var("HOPHOP_ROUTING_FILTER") {
        Ok(pattern) => {
            topic_regex(&pattern).map_err(|e| ConfigError::InvalidValue {
                key: "HOPHOP_ROUTING_FILTER".to_string(),
                message: e.to_string(),
            })?;
            Some(pattern)
        }
        Err(_) => None,
    };

    eprintln!("🐇 HopHop v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Broker: {}", config.redacted_uri());
    eprintln!("   Queue: {}", config.binding.queue);
    if !config.binding.routing_keys.is_empty() {
        eprintln!(
            "   Bindings: {} on {}",
            config.binding.routing_keys.join(", "),
            config.binding.exchange
        );
    }
    eprintln!("   Requeue pacing: {:?}\n", config.requeue_pacing);

    let transport = AmqpTransport::connect(&config).await?;
    let mut consumer_loop = ConsumptionLoop::new(LogConsumer { routing_filter }, transport, config);

    let stop = consumer_loop.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current delivery...");
            stop.stop();
        }
    });

    let ok = consumer_loop.run().await;
    consumer_loop.close().await?;

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
