//! Resilient AMQP pub/sub layer
//!
//! A thin reliability layer over an AMQP broker connection:
//!
//! - **Shared connections**: exactly one physical connection (with separate
//!   publish and subscribe channels) per configuration key, no matter how
//!   many callers race to bootstrap it
//! - **Automatic resubscription**: failed subscriptions re-establish
//!   themselves with a fixed back-off and an attempt counter
//! - **Acknowledgement lifecycle**: explicit ack/nack with prefetch-based
//!   backpressure, undecodable messages acked away instead of wedging the
//!   queue
//! - **Delayed delivery**: broker-side TTL + dead-letter assets, no
//!   process-side timers
//! - **Temporary queues**: exclusive auto-delete queues with idle expiry
//!   for ephemeral subscriptions
//! - **Unified event stream**: `Connected` / `Subscribed` / `Error` over a
//!   broadcast channel
//!
//! ## Example
//!
//! ```ignore
//! use amqp_bus::{AmqpBus, BusConfig, MessageMeta, Payload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), amqp_bus::BusError> {
//!     let config = BusConfig::new("amqp://localhost:5672/%2f", "orders").with_ack(true);
//!     let bus = AmqpBus::new(config);
//!
//!     bus.subscribe(&["orders.created"], "order-worker", |message| async move {
//!         println!("order: {:?}", message.body);
//!         let _ = message.ack().await;
//!     });
//!
//!     bus.publish(
//!         "orders.created",
//!         Payload::json(&serde_json::json!({"id": 1}))?,
//!         MessageMeta::default(),
//!     )
//!     .await
//! }
//! ```

mod bus;
mod config;
mod connector;
mod error;
mod event;
mod message;
pub mod metrics;
mod registry;
mod subscription;
mod transform;

// Re-export main types
pub use bus::AmqpBus;
pub use config::{BusConfig, ExchangeOptions, ExchangeType, DEFAULT_CONFIG_KEY};
pub use connector::{AmqpConnector, ConnectionFailure, ConnectionHandle};
pub use error::BusError;
pub use event::BusEvent;
pub use message::{IncomingMessage, MessageHandler};
pub use metrics::{init_metrics, BusMetrics};
pub use registry::{Bootstrapped, ConnectionEntry, ConnectionRegistry, Connector};
pub use transform::{MessageMeta, Payload, CONTENT_TYPE_JSON};
