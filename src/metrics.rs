//! Prometheus metrics for the bus.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize the Prometheus recorder.
///
/// Call once at startup; subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");
        info!("Prometheus metrics initialized");
        handle
    });
}

/// Get the Prometheus handle for rendering metrics.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format.
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Bus metrics helper.
#[derive(Clone)]
pub struct BusMetrics {
    /// Exchange name for labeling.
    exchange: String,
}

impl BusMetrics {
    /// Create new BusMetrics.
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
        }
    }

    /// Record a successful publish.
    pub fn message_published(&self, duration: Duration) {
        counter!(
            "amqp_bus_messages_published_total",
            "exchange" => self.exchange.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "amqp_bus_publish_duration_seconds",
            "exchange" => self.exchange.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn publish_failed(&self) {
        counter!(
            "amqp_bus_messages_published_total",
            "exchange" => self.exchange.clone(),
            "status" => "failed"
        )
        .increment(1);
    }

    /// Record a consumed message handed to a handler.
    pub fn message_consumed(&self) {
        counter!(
            "amqp_bus_messages_consumed_total",
            "exchange" => self.exchange.clone()
        )
        .increment(1);
    }

    /// Record a message dropped because it could not be decoded.
    pub fn decode_failure(&self) {
        counter!(
            "amqp_bus_decode_failures_total",
            "exchange" => self.exchange.clone()
        )
        .increment(1);
    }

    /// Record a freshly established connection.
    pub fn connection_opened(&self, config_key: &str) {
        counter!(
            "amqp_bus_connections_opened_total",
            "config_key" => config_key.to_string()
        )
        .increment(1);
    }

    /// Record a lost connection.
    pub fn connection_lost(&self, config_key: &str) {
        counter!(
            "amqp_bus_connections_lost_total",
            "config_key" => config_key.to_string()
        )
        .increment(1);
    }

    /// Record a resubscription attempt.
    pub fn resubscribe(&self) {
        counter!(
            "amqp_bus_resubscribes_total",
            "exchange" => self.exchange.clone()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = BusMetrics::new("events");
        assert_eq!(metrics.exchange, "events");
    }
}
