//! Bus event stream.

use crate::error::BusError;

/// Events published on the bus-wide broadcast stream.
///
/// Subscribe with [`AmqpBus::events`](crate::AmqpBus::events). Connection
/// and channel failures, decode-independent subscription failures, and
/// lifecycle notifications all flow here; per-call failures (publish
/// rejection, serialization) are returned to the caller instead.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A physical broker connection was established. Fires once per
    /// connection, not once per caller.
    Connected {
        /// Configuration key the connection serves.
        config_key: String,
        /// Monotonic connection generation.
        generation: u64,
    },

    /// A subscription registered its consumer. Fires once per attempt.
    Subscribed {
        /// Routing keys bound to the queue.
        routing_keys: Vec<String>,
        /// Resolved queue name (generated for temporary queues).
        queue: String,
        /// 1-based attempt counter, incremented on every resubscription.
        attempt: u32,
    },

    /// A connection, channel, or subscription failure.
    Error(BusError),
}

impl BusEvent {
    /// True for [`BusEvent::Error`].
    pub fn is_error(&self) -> bool {
        matches!(self, BusEvent::Error(_))
    }

    /// Borrow the error, if this is an error event.
    pub fn as_error(&self) -> Option<&BusError> {
        match self {
            BusEvent::Error(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_helpers() {
        let event = BusEvent::Error(BusError::connect("refused"));
        assert!(event.is_error());
        assert!(event.as_error().is_some());

        let event = BusEvent::Connected {
            config_key: "default".into(),
            generation: 1,
        };
        assert!(!event.is_error());
        assert!(event.as_error().is_none());
    }
}
