//! Error types for the bus.
//!
//! Connection- and channel-level failures are broadcast on the bus event
//! stream and invalidate the shared connection; decode failures stay local
//! to the subscription that saw them; publish rejections are only reported
//! to the publishing caller.

use thiserror::Error;

/// Bus error.
///
/// Kept `Clone` (string payloads, no source chaining) so a single failure
/// can be fanned out to every waiter of an in-flight bootstrap and onto the
/// broadcast event stream.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The transport connection to the broker could not be established.
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    /// AMQP protocol or channel failure reported by the client.
    #[error("AMQP error: {0}")]
    Amqp(String),

    /// The same configuration key was reused with a materially different
    /// configuration.
    #[error("configuration key {key:?} reused with a different configuration: existing={existing} requested={requested}")]
    ConfigConflict {
        /// The contested configuration key.
        key: String,
        /// The configuration already bound to the key.
        existing: String,
        /// The configuration the caller tried to bind.
        requested: String,
    },

    /// The broker cancelled an active consumer (e.g. its queue was deleted).
    #[error("subscription on queue {queue:?} was cancelled by the broker")]
    SubscriptionCancelled {
        /// Queue whose consumer was cancelled.
        queue: String,
    },

    /// A message body could not be decoded as its declared content type.
    #[error("cannot decode message body: {0}")]
    Decode(String),

    /// A payload could not be serialized for publishing.
    #[error("cannot encode message body: {0}")]
    Serialization(String),

    /// The broker negatively acknowledged a confirmed publish.
    #[error("broker rejected publish on exchange {exchange:?}")]
    PublishRejected {
        /// Exchange the rejected message was published to.
        exchange: String,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// Create a connect error from any displayable cause.
    pub fn connect(cause: impl std::fmt::Display) -> Self {
        BusError::Connect(cause.to_string())
    }

    /// Create a decode error.
    pub fn decode(cause: impl std::fmt::Display) -> Self {
        BusError::Decode(cause.to_string())
    }

    /// Create a configuration error.
    pub fn config(cause: impl std::fmt::Display) -> Self {
        BusError::Config(cause.to_string())
    }

    /// True for failures that invalidate the shared connection, forcing the
    /// next operation through a fresh bootstrap.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, BusError::Connect(_) | BusError::Amqp(_))
    }
}

impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        BusError::Amqp(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failure_classification() {
        assert!(BusError::Connect("refused".into()).is_connection_failure());
        assert!(BusError::Amqp("channel closed".into()).is_connection_failure());

        assert!(!BusError::Decode("bad json".into()).is_connection_failure());
        assert!(
            !BusError::PublishRejected {
                exchange: "events".into()
            }
            .is_connection_failure()
        );
        assert!(
            !BusError::SubscriptionCancelled {
                queue: "orders".into()
            }
            .is_connection_failure()
        );
    }

    #[test]
    fn test_display_carries_context() {
        let err = BusError::ConfigConflict {
            key: "default".into(),
            existing: "a".into(),
            requested: "b".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("default"));
        assert!(msg.contains("existing=a"));
        assert!(msg.contains("requested=b"));

        let err = BusError::SubscriptionCancelled {
            queue: "orders".into(),
        };
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_errors_are_cloneable() {
        // Bootstrap fan-out and the broadcast event stream both rely on this.
        let err = BusError::connect("connection refused");
        let clone = err.clone();
        assert_eq!(err.to_string(), clone.to_string());
    }
}
