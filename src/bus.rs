//! The bus facade.
//!
//! `AmqpBus` ties the pieces together: bootstrap through the connection
//! registry, payload transform, publish (plain, confirmed, delayed),
//! subscription supervision, and the unified event stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{Channel, ExchangeKind};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::connector::{AmqpConnector, ConnectionHandle};
use crate::error::BusError;
use crate::event::BusEvent;
use crate::message::MessageHandler;
use crate::metrics::BusMetrics;
use crate::registry::{Bootstrapped, ConnectionEntry, ConnectionRegistry};
use crate::subscription::{SubscriptionSpec, Supervisor};
use crate::transform::{self, MessageMeta, Payload};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Grace window added to a delay queue's idle expiry so the broker does
/// not garbage-collect it between publishes.
const DELAY_QUEUE_EXPIRY_GRACE_MS: u64 = 60_000;

/// Shared internals handed to supervisors and the failure pump.
#[derive(Clone)]
pub(crate) struct BusContext {
    pub config: BusConfig,
    pub registry: Arc<ConnectionRegistry<AmqpConnector>>,
    pub events: broadcast::Sender<BusEvent>,
    pub metrics: BusMetrics,
}

impl BusContext {
    /// Bootstrap through the registry, emitting `Connected` for a fresh
    /// physical connection and `Error` for a failed one.
    pub async fn bootstrap(&self) -> Result<Bootstrapped<ConnectionHandle>, BusError> {
        match self.registry.bootstrap(&self.config).await {
            Ok(boot) => {
                if boot.fresh {
                    self.metrics.connection_opened(&self.config.config_key);
                    let _ = self.events.send(BusEvent::Connected {
                        config_key: self.config.config_key.clone(),
                        generation: boot.entry.generation,
                    });
                }
                Ok(boot)
            }
            Err(error) => {
                self.emit_error(error.clone());
                Err(error)
            }
        }
    }

    /// React to an operation failure on a live connection: connection-level
    /// failures invalidate the registry slot (generation-guarded) and close
    /// the dead connection; every failure is mirrored on the event stream.
    pub async fn fail(&self, entry: &Arc<ConnectionEntry<ConnectionHandle>>, error: &BusError) {
        if error.is_connection_failure() {
            if let Some(dead) = self
                .registry
                .invalidate(&self.config.config_key, entry.generation)
                .await
            {
                warn!(
                    config_key = %self.config.config_key,
                    generation = dead.generation,
                    error = %error,
                    "Broker connection invalidated"
                );
                self.metrics.connection_lost(&self.config.config_key);
                let _ = dead.handle.connection.close(200, "superseded").await;
            }
        }
        self.emit_error(error.clone());
    }

    pub fn emit_error(&self, error: BusError) {
        let _ = self.events.send(BusEvent::Error(error));
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: BusConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let metrics = BusMetrics::new(&config.exchange);
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new(AmqpConnector::new())),
            events,
            metrics,
        }
    }
}

#[derive(Default)]
struct DelayCache {
    generation: u64,
    ready: HashSet<String>,
}

/// Resilient publish/subscribe facade over one shared broker connection.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_bus::{AmqpBus, BusConfig, MessageMeta, Payload};
///
/// let bus = AmqpBus::new(BusConfig::new("amqp://localhost:5672/%2f", "orders"));
/// bus.subscribe_tmp(&["orders.*"], |message| async move {
///     println!("got {:?}", message.body);
/// });
/// bus.publish(
///     "orders.created",
///     Payload::json(&serde_json::json!({"id": 1}))?,
///     MessageMeta::default(),
/// )
/// .await?;
/// ```
pub struct AmqpBus {
    ctx: BusContext,
    shutdown: watch::Sender<bool>,
    delayed: Mutex<DelayCache>,
}

impl AmqpBus {
    /// Create a bus with its own private connection registry.
    pub fn new(config: BusConfig) -> Self {
        Self::with_registry(
            config,
            Arc::new(ConnectionRegistry::new(AmqpConnector::new())),
        )
    }

    /// Create a bus on a shared registry, so several bus instances can
    /// share physical connections per configuration key.
    pub fn with_registry(
        config: BusConfig,
        registry: Arc<ConnectionRegistry<AmqpConnector>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let metrics = BusMetrics::new(&config.exchange);
        let ctx = BusContext {
            config,
            registry,
            events,
            metrics,
        };

        Self::spawn_failure_pump(ctx.clone(), shutdown.subscribe());

        Self {
            ctx,
            shutdown,
            delayed: Mutex::new(DelayCache::default()),
        }
    }

    /// Forwards connection-level failures from the connector onto this
    /// bus's event stream, invalidating the registry slot first so the
    /// next operation re-bootstraps.
    fn spawn_failure_pump(ctx: BusContext, mut shutdown: watch::Receiver<bool>) {
        let mut failures = ctx.registry.connector().failures();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    failure = failures.recv() => match failure {
                        Ok(failure) => {
                            if failure.config_key != ctx.config.config_key {
                                continue;
                            }
                            if let Some(dead) = ctx
                                .registry
                                .invalidate(&failure.config_key, failure.generation)
                                .await
                            {
                                warn!(
                                    config_key = %failure.config_key,
                                    generation = dead.generation,
                                    error = %failure.error,
                                    "Broker connection lost"
                                );
                                ctx.metrics.connection_lost(&failure.config_key);
                            }
                            ctx.emit_error(failure.error);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Failure pump lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Failure pump stopped");
        });
    }

    /// Subscribe to the unified event stream (`Connected`, `Subscribed`,
    /// `Error`).
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.ctx.events.subscribe()
    }

    /// The configuration this bus was created with.
    pub fn config(&self) -> &BusConfig {
        &self.ctx.config
    }

    /// Publish a message on the configured exchange.
    ///
    /// Without publisher confirms the call resolves as soon as the frame
    /// is written; with confirms it resolves only once the broker
    /// acknowledged the message, and a broker nack is a
    /// [`BusError::PublishRejected`].
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: Payload,
        meta: MessageMeta,
    ) -> Result<(), BusError> {
        let started = Instant::now();
        let boot = self.ctx.bootstrap().await?;
        let (bytes, properties) = transform::encode(payload, &meta)?;

        let result = self
            .confirmed_publish(
                &boot.entry.handle.pub_channel,
                &self.ctx.config.exchange,
                routing_key,
                &bytes,
                properties,
            )
            .await;

        match &result {
            Ok(()) => self.ctx.metrics.message_published(started.elapsed()),
            Err(error) => {
                self.ctx.metrics.publish_failed();
                if error.is_connection_failure() {
                    self.ctx.fail(&boot.entry, error).await;
                }
            }
        }
        result
    }

    /// Publish a message that the broker holds back for `delay` before
    /// routing it to the configured exchange with the original routing
    /// key.
    ///
    /// Implemented broker-side: a fanout exchange feeds a TTL queue whose
    /// dead-letter target is the real exchange, so no process-side timer
    /// is involved. The exchange/queue pair is provisioned lazily, once
    /// per `(exchange, delay)` per connection generation.
    pub async fn delayed_publish(
        &self,
        routing_key: &str,
        payload: Payload,
        delay: Duration,
        meta: MessageMeta,
    ) -> Result<(), BusError> {
        let started = Instant::now();
        let boot = self.ctx.bootstrap().await?;
        let delay_ms = delay.as_millis() as u64;
        let asset = delay_asset_name(&self.ctx.config.exchange, delay_ms);

        let needs_setup = {
            let mut cache = self.delayed.lock().await;
            if cache.generation != boot.entry.generation {
                cache.generation = boot.entry.generation;
                cache.ready.clear();
            }
            !cache.ready.contains(&asset)
        };

        let channel = &boot.entry.handle.pub_channel;
        let result = async {
            if needs_setup {
                self.declare_delay_asset(channel, &asset, delay_ms).await?;
            }
            let (bytes, properties) = transform::encode(payload, &meta)?;
            self.confirmed_publish(channel, &asset, routing_key, &bytes, properties)
                .await
        }
        .await;

        match &result {
            Ok(()) => {
                if needs_setup {
                    let mut cache = self.delayed.lock().await;
                    if cache.generation == boot.entry.generation {
                        cache.ready.insert(asset);
                    }
                }
                self.ctx.metrics.message_published(started.elapsed());
            }
            Err(error) => {
                self.ctx.metrics.publish_failed();
                if error.is_connection_failure() {
                    self.ctx.fail(&boot.entry, error).await;
                }
            }
        }
        result
    }

    async fn declare_delay_asset(
        &self,
        channel: &Channel,
        asset: &str,
        delay_ms: u64,
    ) -> Result<(), BusError> {
        channel
            .exchange_declare(
                asset,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from(self.ctx.config.exchange.clone())),
        );
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(delay_ms as i64),
        );
        arguments.insert(
            "x-expires".into(),
            AMQPValue::LongLongInt((delay_ms + DELAY_QUEUE_EXPIRY_GRACE_MS) as i64),
        );
        channel
            .queue_declare(
                asset,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;

        channel
            .queue_bind(
                asset,
                asset,
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(asset = %asset, delay_ms, "Delay asset provisioned");
        Ok(())
    }

    async fn confirmed_publish(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        bytes: &[u8],
        properties: lapin::BasicProperties,
    ) -> Result<(), BusError> {
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                bytes,
                properties,
            )
            .await?;

        if self.ctx.config.confirm {
            match confirm.await? {
                Confirmation::Nack(_) => Err(BusError::PublishRejected {
                    exchange: exchange.to_string(),
                }),
                _ => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    /// Subscribe `handler` to `routing_keys` on the named durable queue.
    ///
    /// Returns the supervisor task handle; the subscription keeps running
    /// if it is dropped, and ends on [`AmqpBus::shutdown`].
    pub fn subscribe(
        &self,
        routing_keys: &[&str],
        queue: &str,
        handler: impl MessageHandler + 'static,
    ) -> tokio::task::JoinHandle<()> {
        self.spawn_subscription(routing_keys, Some(queue.to_string()), Arc::new(handler))
    }

    /// Subscribe `handler` to `routing_keys` on a generated temporary
    /// queue (exclusive, auto-delete, idle-expiring).
    pub fn subscribe_tmp(
        &self,
        routing_keys: &[&str],
        handler: impl MessageHandler + 'static,
    ) -> tokio::task::JoinHandle<()> {
        self.spawn_subscription(routing_keys, None, Arc::new(handler))
    }

    fn spawn_subscription(
        &self,
        routing_keys: &[&str],
        queue: Option<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> tokio::task::JoinHandle<()> {
        let spec = SubscriptionSpec {
            routing_keys: routing_keys.iter().map(|key| key.to_string()).collect(),
            queue,
            handler,
        };
        let supervisor = Supervisor::new(self.ctx.clone(), spec);
        tokio::spawn(supervisor.run(self.shutdown.subscribe()))
    }

    /// Delete a queue, returning the number of messages it still held.
    pub async fn delete_queue(&self, queue: &str) -> Result<u32, BusError> {
        let boot = self.ctx.bootstrap().await?;
        let count = boot
            .entry
            .handle
            .pub_channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        info!(queue = %queue, messages = count, "Queue deleted");
        Ok(count)
    }

    /// Stop every supervisor and close the shared connection, if one is
    /// open.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        let _ = self.shutdown.send(true);
        if let Some(entry) = self.ctx.registry.take(&self.ctx.config.config_key).await {
            entry.handle.connection.close(200, "shutdown").await?;
            info!(config_key = %self.ctx.config.config_key, "Bus shut down");
        }
        Ok(())
    }
}

/// `{exchange}-amqp-bus-delayed-{ms}` name for delay exchange/queue pairs.
fn delay_asset_name(exchange: &str, delay_ms: u64) -> String {
    format!("{exchange}-amqp-bus-delayed-{delay_ms}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IncomingMessage;
    use tokio::time::timeout;

    #[test]
    fn test_delay_asset_name() {
        assert_eq!(
            delay_asset_name("events", 2500),
            "events-amqp-bus-delayed-2500"
        );
    }

    #[tokio::test]
    async fn test_creating_a_bus_does_not_connect() {
        let bus = AmqpBus::new(BusConfig::new("amqp://127.0.0.1:1", "events"));
        assert!(bus.ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_connect_error_and_event() {
        // Port 1 refuses connections immediately.
        let bus = AmqpBus::new(BusConfig::new("amqp://127.0.0.1:1", "events"));
        let mut events = bus.events();

        let err = bus
            .publish("orders.created", Payload::from("hi"), MessageMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Connect(_)));

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within deadline")
            .unwrap();
        assert!(event.is_error());
    }

    #[tokio::test]
    async fn test_subscribe_reports_bootstrap_failure_and_stops_when_retry_disabled() {
        let config = BusConfig::new("amqp://127.0.0.1:1", "events").with_resubscribe_on_error(false);
        let bus = AmqpBus::new(config);
        let mut events = bus.events();

        let task = bus.subscribe_tmp(&["orders.*"], |_message: IncomingMessage| async {});

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within deadline")
            .unwrap();
        assert!(event.is_error());

        // With resubscription disabled the supervisor ends after reporting.
        timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_without_connection_is_clean() {
        let bus = AmqpBus::new(BusConfig::new("amqp://127.0.0.1:1", "events"));
        bus.shutdown().await.unwrap();
    }
}
