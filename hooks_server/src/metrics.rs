//! Prometheus metrics for build hook observability.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics(listen: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(listen);
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!("hooks_webhooks_received_total", "outcome" => outcome).increment(1);
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("hooks_builds_total", "status" => status.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("hooks_build_duration_ms").record(duration_ms as f64);
}

/// Set current realtime subscriber count.
pub fn realtime_subscribers(count: usize) {
    gauge!("hooks_realtime_subscribers").set(count as f64);
}

/// Record messages dropped for a lagging subscriber.
pub fn realtime_messages_dropped(count: u64) {
    counter!("hooks_realtime_dropped_total").increment(count);
}

/// Record a failed snapshot write.
pub fn snapshot_failed() {
    counter!("hooks_snapshot_failures_total").increment(1);
}
