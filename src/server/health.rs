use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::server::{api, ServerState};
use crate::utils::error::ChatError;

/// Struct for managing server health metrics.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Tracks the number of active WebSocket connections.
    pub connections: IntGauge,
    /// Counts the total number of frames received from clients.
    pub messages_received: IntCounter,
    /// Counts frames queued to clients by room fan-out.
    pub messages_broadcast: IntCounter,
    /// Counts posts refused by the message rate limiter.
    pub messages_rejected: IntCounter,
    /// Counts fabric payloads dropped as undecodable or misrouted.
    pub fabric_payloads_dropped: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMetrics {
    /// Creates a new instance of `HealthMetrics` and registers the metrics with Prometheus.
    pub fn new() -> Self {
        let registry = Registry::new();
        let connections = gauge(&registry, "connections", "Active connections");
        let messages_received = counter(&registry, "messages_received", "Total frames received");
        let messages_broadcast =
            counter(&registry, "messages_broadcast", "Total frames queued by room fan-out");
        let messages_rejected =
            counter(&registry, "messages_rejected", "Total posts refused by the rate limiter");
        let fabric_payloads_dropped = counter(
            &registry,
            "fabric_payloads_dropped",
            "Total fabric payloads dropped before fan-out",
        );

        Self {
            connections,
            messages_received,
            messages_broadcast,
            messages_rejected,
            fabric_payloads_dropped,
            registry,
        }
    }

    /// Exposes the current state of all registered metrics in Prometheus-compatible format.
    pub fn expose_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

// Panics on an invalid or duplicate metric definition.
fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

/// Serves the HTTP API and `/metrics` on `http_port` until `cancel` fires.
///
/// # Errors
/// Returns `ChatError::ConfigurationError` if the port cannot be bound.
pub async fn serve_http(state: Arc<ServerState>, cancel: CancellationToken) -> Result<(), ChatError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.http_port));
    let app = api::router(state);

    let server = axum::Server::try_bind(&addr)
        .map_err(|e| ChatError::ConfigurationError(format!("HTTP bind {} failed: {}", addr, e)))?
        .serve(app.into_make_service());
    info!("HTTP API listening on {}", addr);

    server
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ChatError::ConnectionError(e.to_string()))
}

/// Handles the `/metrics` HTTP request and returns the current metrics data.
pub async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.metrics.expose_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_registered_metrics() {
        let metrics = HealthMetrics::new();
        metrics.connections.inc();
        metrics.messages_rejected.inc_by(3);

        let text = metrics.expose_metrics().unwrap();
        assert!(text.contains("connections 1"));
        assert!(text.contains("messages_rejected 3"));
        assert!(text.contains("fabric_payloads_dropped 0"));
    }
}
