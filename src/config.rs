//! Configuration types.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Default pause after a requeue before pulling the next delivery.
const DEFAULT_REQUEUE_PACING: Duration = Duration::from_secs(1);

/// Default time the transport waits for a delivery per pull.
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default gap between `basic.get` polls while waiting for a delivery.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to do with a delivery that a filter halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HaltAction {
    /// Treat the skip as handled and drop the delivery.
    #[default]
    Acknowledge,
    /// Put the delivery back on the queue.
    Requeue,
}

impl HaltAction {
    /// Parse an env-style name (`ack`, `acknowledge`, `requeue`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ack" | "acknowledge" => Some(Self::Acknowledge),
            "requeue" => Some(Self::Requeue),
            _ => None,
        }
    }
}

/// Where a consumer's queue lives and which routing keys feed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Topic exchange the queue is bound to.
    pub exchange: String,
    /// Queue to consume from.
    pub queue: String,
    /// Routing keys (topic patterns) bound to the queue.
    pub routing_keys: Vec<String>,
}

impl QueueBinding {
    /// Binding for `queue` on the default `events` exchange.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            exchange: "events".to_string(),
            queue: queue.into(),
            routing_keys: Vec::new(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn bind(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_keys.push(routing_key.into());
        self
    }
}

/// Consumption loop configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Broker host name.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// Broker virtual host.
    pub vhost: String,
    /// Broker user.
    pub username: String,
    /// Broker password.
    pub password: SecretString,
    /// Pause after a requeue before the next pull (zero disables pacing).
    pub requeue_pacing: Duration,
    /// How long a single pull waits for a delivery.
    pub receive_timeout: Duration,
    /// Gap between broker polls inside one pull.
    pub poll_interval: Duration,
    /// Resolution for filter-halted deliveries.
    pub halt_action: HaltAction,
    /// Queue and routing keys to consume.
    pub binding: QueueBinding,
    /// Stop cleanly after this many resolved deliveries.
    pub max_messages: Option<u64>,
}

impl ConsumerConfig {
    /// Default configuration for `queue`.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: SecretString::from("guest"),
            requeue_pacing: DEFAULT_REQUEUE_PACING,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            halt_action: HaltAction::default(),
            binding: QueueBinding::new(queue),
            max_messages: None,
        }
    }

    pub fn with_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.broker_host = host.into();
        self.broker_port = port;
        self
    }

    pub fn with_requeue_pacing(mut self, pacing: Duration) -> Self {
        self.requeue_pacing = pacing;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_halt_action(mut self, action: HaltAction) -> Self {
        self.halt_action = action;
        self
    }

    pub fn with_binding(mut self, binding: QueueBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn with_max_messages(mut self, max: u64) -> Self {
        self.max_messages = Some(max);
        self
    }

    /// Load configuration from `HOPHOP_*` environment variables.
    ///
    /// `HOPHOP_QUEUE` is required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue = lookup("HOPHOP_QUEUE")
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("HOPHOP_QUEUE".to_string()))?;

        let mut config = Self::new(queue);

        if let Some(host) = lookup("HOPHOP_BROKER_HOST") {
            config.broker_host = host;
        }
        if let Some(port) = lookup("HOPHOP_BROKER_PORT") {
            config.broker_port = parse_value("HOPHOP_BROKER_PORT", &port)?;
        }
        if let Some(vhost) = lookup("HOPHOP_VHOST") {
            config.vhost = vhost;
        }
        if let Some(user) = lookup("HOPHOP_USERNAME") {
            config.username = user;
        }
        if let Some(password) = lookup("HOPHOP_PASSWORD") {
            config.password = SecretString::from(password);
        }
        if let Some(secs) = lookup("HOPHOP_REQUEUE_PACING_SECS") {
            let secs: f64 = parse_value("HOPHOP_REQUEUE_PACING_SECS", &secs)?;
            config.requeue_pacing =
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
                    key: "HOPHOP_REQUEUE_PACING_SECS".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Some(ms) = lookup("HOPHOP_RECEIVE_TIMEOUT_MS") {
            config.receive_timeout =
                Duration::from_millis(parse_value("HOPHOP_RECEIVE_TIMEOUT_MS", &ms)?);
        }
        if let Some(action) = lookup("HOPHOP_HALT_ACTION") {
            config.halt_action =
                HaltAction::from_name(&action).ok_or_else(|| ConfigError::InvalidValue {
                    key: "HOPHOP_HALT_ACTION".to_string(),
                    message: format!("expected `ack` or `requeue`, got `{action}`"),
                })?;
        }
        if let Some(exchange) = lookup("HOPHOP_EXCHANGE") {
            config.binding.exchange = exchange;
        }
        if let Some(keys) = lookup("HOPHOP_ROUTING_KEYS") {
            config.binding.routing_keys = keys
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(max) = lookup("HOPHOP_MAX_MESSAGES") {
            config.max_messages = Some(parse_value("HOPHOP_MAX_MESSAGES", &max)?);
        }

        Ok(config)
    }

    /// AMQP connection URI for this configuration.
    ///
    /// Credentials and vhost are percent-encoded. The default vhost `/`
    /// becomes `%2F`; any other vhost drops its leading slash.
    pub fn amqp_uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => "/",
            other => other.trim_start_matches('/'),
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(self.password.expose_secret()),
            self.broker_host,
            self.broker_port,
            urlencoding::encode(vhost)
        )
    }

    /// Connection URI with the password masked, for logging.
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.username, self.broker_host, self.broker_port, self.vhost
        )
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("`{raw}`: {e}"),
    })
}
