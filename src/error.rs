//! Error types for HopHop.

/// Top-level error type for the consumer runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Broker transport errors.
///
/// Any fatal one reaching the consumption loop stops it immediately and
/// marks the run as failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {uri} failed: {reason}")]
    Connection { uri: String, reason: String },

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Acknowledge failed for delivery {delivery_tag}: {reason}")]
    Acknowledge { delivery_tag: u64, reason: String },

    #[error("Requeue failed for delivery {delivery_tag}: {reason}")]
    Requeue { delivery_tag: u64, reason: String },

    #[error("Failed to decode delivery {delivery_tag}: {reason}")]
    Decode { delivery_tag: u64, reason: String },

    #[error("Transport is closed")]
    Closed,

    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl TransportError {
    /// Whether the connection can no longer be trusted.
    ///
    /// A delivery that failed to decode says nothing about the connection;
    /// the transport has already settled it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode { .. })
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failures_are_not_fatal() {
        let decode = TransportError::Decode {
            delivery_tag: 3,
            reason: "bad json".to_string(),
        };
        assert!(!decode.is_fatal());
        assert!(TransportError::Receive("reset".to_string()).is_fatal());
        assert!(TransportError::Closed.is_fatal());
    }

    #[test]
    fn component_errors_fold_into_error() {
        fn load() -> Result<()> {
            let missing: std::result::Result<(), ConfigError> =
                Err(ConfigError::MissingEnvVar("HOPHOP_QUEUE".to_string()));
            missing?;
            Ok(())
        }
        let err = load().unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::MissingEnvVar(_))));
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required environment variable: HOPHOP_QUEUE"
        );

        let err: Error = TransportError::Closed.into();
        assert!(matches!(err, Error::Transport(TransportError::Closed)));
    }
}
