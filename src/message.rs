//! Inbound messages and the handler trait.

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::BasicProperties;

use crate::error::BusError;
use crate::transform::Payload;

/// A decoded message delivered to a [`MessageHandler`].
///
/// Owns its acknowledgement handle, so a handler may stash the message and
/// acknowledge later. When the bus runs without acknowledgement mode the
/// handle is inert and `ack`/`nack` are no-ops.
pub struct IncomingMessage {
    /// Decoded body.
    pub body: Payload,
    /// Exchange the message arrived through.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// True when the broker redelivered the message.
    pub redelivered: bool,
    /// Raw AMQP properties.
    pub properties: BasicProperties,
    acker: Option<Acker>,
}

impl IncomingMessage {
    pub(crate) fn new(
        body: Payload,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        properties: BasicProperties,
        acker: Option<Acker>,
    ) -> Self {
        Self {
            body,
            exchange,
            routing_key,
            redelivered,
            properties,
            acker,
        }
    }

    /// True when the bus expects this message to be acknowledged.
    pub fn ack_required(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledge the message. No-op without acknowledgement mode.
    pub async fn ack(&self) -> Result<(), BusError> {
        match &self.acker {
            Some(acker) => acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(BusError::from),
            None => Ok(()),
        }
    }

    /// Reject the message, optionally requeueing it. With `requeue` false
    /// the broker drops it or dead-letters it if the queue is configured
    /// with a dead-letter exchange. No-op without acknowledgement mode.
    pub async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        match &self.acker {
            Some(acker) => acker
                .nack(BasicNackOptions {
                    requeue,
                    ..Default::default()
                })
                .await
                .map_err(BusError::from),
            None => Ok(()),
        }
    }
}

/// Handles decoded messages for a subscription.
///
/// Implemented for any `Fn(IncomingMessage) -> impl Future<Output = ()>`
/// closure, so simple subscriptions can pass an async closure directly.
///
/// # Example
///
/// ```rust,ignore
/// struct OrderHandler;
///
/// #[async_trait]
/// impl MessageHandler for OrderHandler {
///     async fn handle(&self, message: IncomingMessage) {
///         if message.body.as_json().is_some() {
///             let _ = message.ack().await;
///         } else {
///             let _ = message.nack(false).await;
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one decoded message.
    async fn handle(&self, message: IncomingMessage);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, message: IncomingMessage) {
        (self)(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inert_message() -> IncomingMessage {
        IncomingMessage::new(
            Payload::Text("hi".into()),
            "events".into(),
            "orders.created".into(),
            false,
            BasicProperties::default(),
            None,
        )
    }

    #[tokio::test]
    async fn test_ack_without_ack_mode_is_a_noop() {
        let message = inert_message();
        assert!(!message.ack_required());
        message.ack().await.unwrap();
        message.nack(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_closures_are_handlers() {
        let handler = |message: IncomingMessage| async move {
            assert_eq!(message.routing_key, "orders.created");
        };
        handler.handle(inert_message()).await;
    }
}
