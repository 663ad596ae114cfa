//! Subscription supervision.
//!
//! Every `subscribe` call spawns one supervisor task that owns the
//! subscription state (routing keys, queue spec, handler, attempt counter)
//! and walks a small state machine:
//!
//! ```text
//! ┌──────────────┐  subscribe()   ┌─────────────┐  consume registered  ┌────────┐
//! │ Unsubscribed │ ─────────────> │ Subscribing │ ───────────────────> │ Active │
//! └──────────────┘                └─────────────┘                      └────────┘
//!        ^                               ^                                  │
//!        │ resubscribe disabled          │ 5 s delay, attempt + 1           │ consumer ends,
//!        │ or shutdown                   │                                  │ cancellation, or
//!        │                        ┌───────────────┐                         │ bus error event
//!        └─────────────────────── │ AwaitingRetry │ <───────────────────────┘
//!                                 └───────────────┘
//! ```
//!
//! One task per subscription means one retry timer per subscription: a
//! burst of error events cannot schedule duplicate retries, and one
//! subscription's retry never blocks another's.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::Consumer;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::BusContext;
use crate::connector::ConnectionHandle;
use crate::error::BusError;
use crate::event::BusEvent;
use crate::message::{IncomingMessage, MessageHandler};
use crate::registry::Bootstrapped;
use crate::transform;

/// Fixed delay before a failed subscription is re-established.
pub(crate) const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Caller-provided subscription parameters.
pub(crate) struct SubscriptionSpec {
    /// Routing key patterns bound to the queue (fan-in when several).
    pub routing_keys: Vec<String>,
    /// Explicit queue name, or `None` for a temporary exclusive queue.
    pub queue: Option<String>,
    /// Message handler.
    pub handler: Arc<dyn MessageHandler>,
}

enum SessionEnd {
    Retry,
    Shutdown,
}

/// Watchdog owning one subscription across reconnects.
pub(crate) struct Supervisor {
    ctx: BusContext,
    spec: SubscriptionSpec,
}

impl Supervisor {
    pub(crate) fn new(ctx: BusContext, spec: SubscriptionSpec) -> Self {
        Self { ctx, spec }
    }

    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 1;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.session(attempt, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Retry => {
                    if !self.ctx.config.resubscribe_on_error {
                        debug!(
                            routing_keys = ?self.spec.routing_keys,
                            "Resubscription disabled; subscription ends"
                        );
                        break;
                    }
                    info!(
                        delay_secs = RESUBSCRIBE_DELAY.as_secs(),
                        attempt = attempt + 1,
                        routing_keys = ?self.spec.routing_keys,
                        "Scheduling resubscription"
                    );
                    self.ctx.metrics.resubscribe();
                    tokio::select! {
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                        result = shutdown.changed() => {
                            if result.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    attempt += 1;
                }
            }
        }
        debug!(routing_keys = ?self.spec.routing_keys, "Subscription supervisor stopped");
    }

    /// One Subscribing → Active pass; returns why the session ended.
    async fn session(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let boot = match self.ctx.bootstrap().await {
            Ok(boot) => boot,
            // Already reported on the event stream by bootstrap.
            Err(_) => return SessionEnd::Retry,
        };

        let (queue_name, mut consumer) = match self.establish(&boot, attempt).await {
            Ok(established) => established,
            Err(error) => {
                self.ctx.fail(&boot.entry, &error).await;
                return SessionEnd::Retry;
            }
        };

        info!(
            queue = %queue_name,
            routing_keys = ?self.spec.routing_keys,
            attempt,
            "Subscribed"
        );
        let _ = self.ctx.events.send(BusEvent::Subscribed {
            routing_keys: self.spec.routing_keys.clone(),
            queue: queue_name.clone(),
            attempt,
        });

        let mut errors = self.ctx.events.subscribe();
        let end = loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                event = errors.recv() => match event {
                    Ok(BusEvent::Error(error)) => {
                        debug!(error = %error, queue = %queue_name, "Bus error observed; subscription will retry");
                        break SessionEnd::Retry;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscription lagged behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break SessionEnd::Shutdown,
                },
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.handle_delivery(delivery).await,
                    Some(Err(error)) => {
                        let error = BusError::from(error);
                        self.ctx.fail(&boot.entry, &error).await;
                        break SessionEnd::Retry;
                    }
                    // The broker cancelled the consumer, e.g. the queue was
                    // deleted out from under us.
                    None => {
                        warn!(queue = %queue_name, "Subscription cancelled by broker");
                        self.ctx.emit_error(BusError::SubscriptionCancelled {
                            queue: queue_name.clone(),
                        });
                        break SessionEnd::Retry;
                    }
                },
            }
        };

        // Withdraw the consumer before leaving the session. Without this a
        // retry over a still-healthy channel would register a second
        // consumer on the same queue and split its deliveries.
        let _ = boot
            .entry
            .handle
            .sub_channel
            .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
            .await;

        end
    }

    /// Declare topology and register the consumer. Safe to repeat: every
    /// declaration is idempotent against the broker.
    async fn establish(
        &self,
        boot: &Bootstrapped<ConnectionHandle>,
        attempt: u32,
    ) -> Result<(String, Consumer), BusError> {
        let config = &self.ctx.config;
        let channel = &boot.entry.handle.sub_channel;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .exchange_declare(
                &config.exchange,
                config.exchange_type.to_lapin(),
                ExchangeDeclareOptions {
                    durable: config.exchange_options.durable,
                    auto_delete: config.exchange_options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (queue_name, options, arguments) = self.queue_plan();
        channel.queue_declare(&queue_name, options, arguments).await?;
        for key in &self.spec.routing_keys {
            channel
                .queue_bind(
                    &queue_name,
                    &config.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let consumer_tag = format!("{}-{}", config.product_name, random_suffix());
        let consumer = channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: !config.ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue_name, consumer_tag = %consumer_tag, attempt, "Consumer registered");
        Ok((queue_name, consumer))
    }

    /// Resolve the queue name, declare options, and arguments.
    ///
    /// Named queues are durable and carry the configured arguments.
    /// Temporary queues are exclusive auto-delete queues that expire after
    /// the configured idle TTL.
    fn queue_plan(&self) -> (String, QueueDeclareOptions, FieldTable) {
        let config = &self.ctx.config;
        let mut arguments = FieldTable::default();

        let (name, options) = match &self.spec.queue {
            Some(queue) => (
                queue.clone(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
            ),
            None => {
                arguments.insert(
                    "x-expires".into(),
                    AMQPValue::LongLongInt(config.tmp_queue_ttl_ms as i64),
                );
                (
                    temporary_queue_name(&config.product_name),
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                )
            }
        };

        for (key, value) in &config.queue_arguments {
            arguments.insert(key.as_str().into(), json_to_amqp(value));
        }

        (name, options, arguments)
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        match transform::decode(&delivery.properties, &delivery.data) {
            Err(error) => {
                warn!(
                    error = %error,
                    routing_key = %delivery.routing_key,
                    "Ignoring undecodable message"
                );
                self.ctx.metrics.decode_failure();
                // Ack it away so it cannot block the queue.
                if self.ctx.config.ack {
                    if let Err(ack_error) = delivery.acker.ack(BasicAckOptions::default()).await {
                        warn!(error = %ack_error, "Failed to ack undecodable message");
                    }
                }
            }
            Ok(body) => {
                self.ctx.metrics.message_consumed();
                let message = IncomingMessage::new(
                    body,
                    delivery.exchange.to_string(),
                    delivery.routing_key.to_string(),
                    delivery.redelivered,
                    delivery.properties.clone(),
                    self.ctx.config.ack.then(|| delivery.acker),
                );
                self.spec.handler.handle(message).await;
            }
        }
    }
}

/// `{product}-{hex}` name for temporary queues.
fn temporary_queue_name(product_name: &str) -> String {
    format!("{product_name}-{}", random_suffix())
}

fn random_suffix() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..8].to_string()
}

fn json_to_amqp(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Bool(flag) => AMQPValue::Boolean(*flag),
        serde_json::Value::Number(number) if number.is_i64() => {
            AMQPValue::LongLongInt(number.as_i64().unwrap_or_default())
        }
        serde_json::Value::Number(number) => AMQPValue::Double(number.as_f64().unwrap_or_default()),
        serde_json::Value::String(text) => AMQPValue::LongString(LongString::from(text.clone())),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;

    fn supervisor(config: BusConfig, queue: Option<String>) -> Supervisor {
        let handler = |_message: IncomingMessage| async {};
        Supervisor::new(
            BusContext::for_tests(config),
            SubscriptionSpec {
                routing_keys: vec!["orders.*".to_string()],
                queue,
                handler: Arc::new(handler),
            },
        )
    }

    #[test]
    fn test_retry_delay_is_five_seconds() {
        assert_eq!(RESUBSCRIBE_DELAY, Duration::from_secs(5));
    }

    #[test]
    fn test_temporary_queue_name_shape() {
        let name = temporary_queue_name("billing");
        let suffix = name.strip_prefix("billing-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(temporary_queue_name("billing"), temporary_queue_name("billing"));
    }

    #[test]
    fn test_named_queue_plan_is_durable() {
        let config = BusConfig::new("amqp://localhost", "events")
            .with_queue_argument("x-dead-letter-exchange", "events.dead");
        let supervisor = supervisor(config, Some("orders".to_string()));

        let (name, options, arguments) = supervisor.queue_plan();
        assert_eq!(name, "orders");
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
        assert!(arguments
            .inner()
            .iter()
            .any(|(key, _)| key.as_str() == "x-dead-letter-exchange"));
        assert!(!arguments.inner().iter().any(|(key, _)| key.as_str() == "x-expires"));
    }

    #[test]
    fn test_temporary_queue_plan_expires() {
        let config = BusConfig::new("amqp://localhost", "events").with_product_name("billing");
        let supervisor = supervisor(config, None);

        let (name, options, arguments) = supervisor.queue_plan();
        assert!(name.starts_with("billing-"));
        assert!(options.exclusive);
        assert!(options.auto_delete);
        assert!(!options.durable);

        let expires = arguments
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == "x-expires")
            .map(|(_, value)| value.clone());
        assert_eq!(expires, Some(AMQPValue::LongLongInt(60_000)));
    }

    #[test]
    fn test_json_to_amqp_mapping() {
        assert_eq!(
            json_to_amqp(&serde_json::json!(true)),
            AMQPValue::Boolean(true)
        );
        assert_eq!(
            json_to_amqp(&serde_json::json!(42)),
            AMQPValue::LongLongInt(42)
        );
        assert_eq!(
            json_to_amqp(&serde_json::json!(1.5)),
            AMQPValue::Double(1.5)
        );
        assert_eq!(
            json_to_amqp(&serde_json::json!("dead")),
            AMQPValue::LongString(LongString::from("dead"))
        );
    }
}
