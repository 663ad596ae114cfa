//! AMQP connector.
//!
//! Establishes one physical connection per bootstrap: a publish channel
//! (confirm-mode when enabled), a subscribe channel, and the configured
//! exchange declared up front. A connection-level error hook is installed
//! exactly once per connection and fans failures out to every bus sharing
//! the registry, which invalidates the slot and re-bootstraps on the next
//! operation.

use async_trait::async_trait;
use lapin::options::{ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::registry::Connector;

const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// One physical broker connection and its two channels.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// The underlying connection.
    pub connection: Connection,
    /// Channel used for publishes (confirm-mode when configured).
    pub pub_channel: Channel,
    /// Channel used for subscriptions.
    pub sub_channel: Channel,
}

/// A connection-level failure, tagged with the key and generation of the
/// connection it belongs to.
#[derive(Debug, Clone)]
pub struct ConnectionFailure {
    /// Configuration key of the failed connection.
    pub config_key: String,
    /// Generation of the failed connection.
    pub generation: u64,
    /// The failure itself.
    pub error: BusError,
}

/// [`Connector`] implementation backed by lapin.
pub struct AmqpConnector {
    failures: broadcast::Sender<ConnectionFailure>,
}

impl AmqpConnector {
    /// Create a connector.
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self { failures }
    }

    /// Subscribe to connection-level failures.
    pub fn failures(&self) -> broadcast::Receiver<ConnectionFailure> {
        self.failures.subscribe()
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Handle = ConnectionHandle;

    async fn connect(
        &self,
        config: &BusConfig,
        generation: u64,
    ) -> Result<Self::Handle, BusError> {
        let uri = config.broker_uri();
        let mut properties =
            ConnectionProperties::default().with_connection_name(config.product_name.as_str().into());
        properties.client_properties.insert(
            "product".into(),
            AMQPValue::LongString(LongString::from(config.product_name.clone())),
        );

        let connection = Connection::connect(&uri, properties)
            .await
            .map_err(BusError::connect)?;

        // Installed once per physical connection; fires for errors and for
        // the connection closing underneath us.
        let failures = self.failures.clone();
        let config_key = config.config_key.clone();
        connection.on_error(move |error| {
            let _ = failures.send(ConnectionFailure {
                config_key: config_key.clone(),
                generation,
                error: BusError::Amqp(error.to_string()),
            });
        });

        let pub_channel = connection.create_channel().await?;
        if config.confirm {
            pub_channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }
        let sub_channel = connection.create_channel().await?;

        pub_channel
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

        info!(
            config_key = %config.config_key,
            exchange = %config.exchange,
            generation,
            confirm = config.confirm,
            "Broker connection established"
        );

        Ok(ConnectionHandle {
            connection,
            pub_channel,
            sub_channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_is_a_connect_error() {
        // Nothing listens on port 1; the connector must fail cleanly.
        let connector = AmqpConnector::new();
        let config = BusConfig::new("amqp://127.0.0.1:1", "events");

        let err = connector.connect(&config, 1).await.unwrap_err();
        assert!(matches!(err, BusError::Connect(_)));
    }

    #[tokio::test]
    async fn test_failure_stream_is_subscribable_before_any_connection() {
        let connector = AmqpConnector::new();
        let mut failures = connector.failures();
        assert!(matches!(
            failures.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
