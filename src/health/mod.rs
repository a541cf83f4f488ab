//! Health check endpoints

use crate::metrics;
use crate::nats::NatsPublisher;
use crate::shard::{FleetState, ShardSnapshot};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Per-shard line of the readiness report
#[derive(Debug, Serialize)]
pub struct ShardReport {
    pub shard_id: u32,
    pub status: &'static str,
    pub events_received: u64,
    pub latency_ms: Option<u64>,
}

impl From<&ShardSnapshot> for ShardReport {
    fn from(snapshot: &ShardSnapshot) -> Self {
        Self {
            shard_id: snapshot.shard_id,
            status: snapshot.status.as_str(),
            events_received: snapshot.events_received,
            latency_ms: snapshot.latency.map(|l| l.as_millis() as u64),
        }
    }
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub shards_fatal: usize,
    pub nats_connected: bool,
    pub events_received: u64,
    pub shards: Vec<ShardReport>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub fleet: FleetState,
    pub nats: Option<Arc<NatsPublisher>>,
    pub prometheus: PrometheusHandle,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ready_report(&state.fleet, state.nats.as_deref());
    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

fn ready_report(fleet: &FleetState, nats: Option<&NatsPublisher>) -> ReadyResponse {
    let nats_connected = nats.map_or(true, |n| n.is_connected());
    let shards_ready = fleet.ready_shards();

    ReadyResponse {
        ready: shards_ready > 0 && nats_connected,
        shards_total: fleet.shard_count(),
        shards_ready,
        shards_fatal: fleet.fatal_shards(),
        nats_connected,
        events_received: fleet.total_events_received(),
        shards: fleet.snapshots().iter().map(ShardReport::from).collect(),
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::set_shards_ready(state.fleet.ready_shards());
    if let Some(ref nats) = state.nats {
        metrics::set_nats_connected(nats.is_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardStatus;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }

    #[test]
    fn test_not_ready_without_active_shard() {
        let fleet = FleetState::new();
        fleet.register(0);
        fleet.set_status(0, ShardStatus::Identifying);

        let report = ready_report(&fleet, None);
        assert!(!report.ready);
        assert_eq!(report.shards_total, 1);
        assert_eq!(report.shards[0].status, "identifying");
    }

    #[test]
    fn test_ready_report_lists_shards() {
        let fleet = FleetState::new();
        for id in 0..2 {
            fleet.register(id);
        }
        fleet.set_status(0, ShardStatus::Active);
        fleet.set_status(1, ShardStatus::Fatal);

        let report = ready_report(&fleet, None);
        assert!(report.ready);
        assert_eq!(report.shards_ready, 1);
        assert_eq!(report.shards_fatal, 1);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"ready\":true"));
        assert!(json.contains("\"status\":\"fatal\""));
    }
}
