//! Arrakis Shardline daemon
//!
//! - Connects every configured shard through the orchestrator
//! - Forwards dispatches to NATS JetStream when configured
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::{Context, Result};
use arrakis_shardline::config::GatewayConfig;
use arrakis_shardline::events::{serialize_event, EventBus, LifecycleKind};
use arrakis_shardline::health::{self, AppState};
use arrakis_shardline::metrics;
use arrakis_shardline::nats::NatsPublisher;
use arrakis_shardline::rest::RateLimitCoordinator;
use arrakis_shardline::shard::ShardOrchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_shardline={}", gateway_config.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        total_shards = ?gateway_config.total_shards,
        shard_ids = ?gateway_config.shard_ids,
        intents = ?gateway_config.intents,
        "Starting Arrakis Shardline"
    );

    let prometheus = metrics::install_prometheus().context("Failed to install Prometheus recorder")?;
    info!("Prometheus metrics initialized");

    let nats = if let Some(ref url) = gateway_config.nats_url {
        match NatsPublisher::connect(url).await {
            Ok(publisher) => {
                if let Err(e) = publisher.ensure_streams().await {
                    warn!(error = %e, "Failed to ensure NATS streams");
                }
                metrics::set_nats_connected(true);
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                metrics::set_nats_connected(false);
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    let rest = RateLimitCoordinator::new(gateway_config.rest_config())?;
    let orchestrator = ShardOrchestrator::new(rest, gateway_config.shard_config());

    let forwarder = tokio::spawn(forward_events(orchestrator.events().clone(), nats.clone()));
    let watcher = tokio::spawn(watch_lifecycle(orchestrator.events().clone()));

    let app_state = AppState {
        fleet: orchestrator.fleet().clone(),
        nats: nats.clone(),
        prometheus,
    };
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", gateway_config.http_port))?;
    info!(port = gateway_config.http_port, "Starting HTTP server");
    let http_server = axum::serve(listener, health::router(app_state));

    let connect = orchestrator.connect(gateway_config.shard_ids.clone());

    tokio::select! {
        result = async {
            connect.await?;
            info!(shards = orchestrator.shard_ids().len(), "All shards spawned");
            std::future::pending::<Result<()>>().await
        } => {
            if let Err(e) = result {
                error!(error = %e, "Failed to connect shards");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down gateway...");
    orchestrator.disconnect_all();
    forwarder.abort();
    watcher.abort();

    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Publish every dispatch to NATS
async fn forward_events(bus: EventBus, nats: Option<Arc<NatsPublisher>>) {
    let mut events = bus.subscribe_all();
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(ref nats) = nats else {
                    continue;
                };
                let Some(envelope) = serialize_event(&event) else {
                    continue;
                };
                if let Err(e) = nats.publish_event(&envelope).await {
                    metrics::record_error(event.shard_id, e.error_type_label());
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Log shard lifecycle transitions
async fn watch_lifecycle(bus: EventBus) {
    let mut lifecycle = bus.subscribe_lifecycle();
    loop {
        match lifecycle.recv().await {
            Ok(notice) => match notice.kind {
                LifecycleKind::Fatal { code } => {
                    error!(shard_id = notice.shard_id, code, "Shard halted with fatal close code");
                }
                LifecycleKind::Disconnected { code, recovery } => {
                    info!(
                        shard_id = notice.shard_id,
                        code,
                        recovery = recovery.as_str(),
                        "Shard disconnected"
                    );
                }
                kind => info!(shard_id = notice.shard_id, ?kind, "Shard lifecycle"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Lifecycle watcher lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
