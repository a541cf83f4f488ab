//! Prometheus metrics
//!
//! Library code records through the `metrics` facade only. Without an
//! installed recorder every call is a no-op; the daemon installs the
//! Prometheus exporter with [`install_prometheus`].

use crate::gateway::CloseRecovery;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and register metric descriptions
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

/// Register metric descriptions
pub fn describe() {
    describe_counter!(
        "gateway_events_received_total",
        Unit::Count,
        "Dispatch events received from Discord"
    );
    describe_counter!(
        "gateway_events_routed_total",
        Unit::Count,
        "Dispatch events published to NATS"
    );
    describe_counter!(
        "gateway_route_failures_total",
        Unit::Count,
        "Failed event publishes to NATS"
    );
    describe_counter!("gateway_errors_total", Unit::Count, "Gateway errors by type");
    describe_counter!(
        "gateway_reconnects_total",
        Unit::Count,
        "Shard reconnects by recovery class"
    );
    describe_counter!("rest_requests_total", Unit::Count, "REST requests by route and status");
    describe_counter!("rest_ratelimits_total", Unit::Count, "HTTP 429 responses received");

    describe_histogram!(
        "rest_request_duration_seconds",
        Unit::Seconds,
        "REST request round trip"
    );
    describe_histogram!(
        "gateway_event_route_duration_seconds",
        Unit::Seconds,
        "Time to publish an event to NATS"
    );

    describe_gauge!("gateway_shards_ready", Unit::Count, "Shards in the active state");
    describe_gauge!(
        "gateway_heartbeat_latency_seconds",
        Unit::Seconds,
        "Last heartbeat round trip per shard"
    );
    describe_gauge!(
        "gateway_nats_connected",
        Unit::Count,
        "NATS connection status (1=connected, 0=disconnected)"
    );
}

pub fn record_dispatch(shard_id: u32, event: &str) {
    counter!(
        "gateway_events_received_total",
        "shard_id" => shard_id.to_string(),
        "event_type" => event.to_ascii_lowercase()
    )
    .increment(1);
}

pub fn record_route_success(duration: Duration) {
    counter!("gateway_events_routed_total").increment(1);
    histogram!("gateway_event_route_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_route_failure() {
    counter!("gateway_route_failures_total").increment(1);
}

/// `error_type` is a `GatewayError::error_type_label`
pub fn record_error(shard_id: u32, error_type: &'static str) {
    counter!(
        "gateway_errors_total",
        "shard_id" => shard_id.to_string(),
        "error_type" => error_type
    )
    .increment(1);
}

pub fn record_reconnect(shard_id: u32, recovery: CloseRecovery) {
    counter!(
        "gateway_reconnects_total",
        "shard_id" => shard_id.to_string(),
        "recovery" => recovery.as_str()
    )
    .increment(1);
}

pub fn record_heartbeat(shard_id: u32, latency: Duration) {
    gauge!(
        "gateway_heartbeat_latency_seconds",
        "shard_id" => shard_id.to_string()
    )
    .set(latency.as_secs_f64());
}

pub fn record_rest_request(route: &str, status: u16, elapsed: Duration) {
    counter!(
        "rest_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("rest_request_duration_seconds", "route" => route.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_ratelimit(route: &str, global: bool) {
    counter!(
        "rest_ratelimits_total",
        "route" => route.to_string(),
        "scope" => if global { "global" } else { "bucket" }
    )
    .increment(1);
}

pub fn set_shards_ready(count: usize) {
    gauge!("gateway_shards_ready").set(count as f64);
}

pub fn set_nats_connected(connected: bool) {
    gauge!("gateway_nats_connected").set(if connected { 1.0 } else { 0.0 });
}
