//! NATS event publisher

use crate::error::GatewayError;
use crate::events::GatewayEvent;
use crate::metrics;
use async_nats::jetstream::{self, Context as JsContext};
use async_nats::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Stream names
pub mod streams {
    /// Gateway dispatches
    pub const EVENTS: &str = "EVENTS";
}

/// Subject prefixes for routing
pub mod subjects {
    /// Dispatches: events.{event_type}
    pub const EVENTS: &str = "events";
}

/// Retention of the EVENTS stream
const EVENTS_MAX_AGE: Duration = Duration::from_secs(300);

/// `events.message_create` for a MESSAGE_CREATE dispatch
pub fn subject_for(event: &GatewayEvent) -> String {
    format!("{}.{}", subjects::EVENTS, event.event_type.replace('.', "_"))
}

/// NATS publisher for gateway events
pub struct NatsPublisher {
    client: Client,
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server
    pub async fn connect(servers: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;
        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            client,
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Create the EVENTS stream if it does not exist yet
    pub async fn ensure_streams(&self) -> Result<(), GatewayError> {
        use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

        let config = Config {
            name: streams::EVENTS.to_string(),
            subjects: vec![format!("{}.>", subjects::EVENTS)],
            retention: RetentionPolicy::Limits,
            max_age: EVENTS_MAX_AGE,
            storage: StorageType::Memory,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| GatewayError::NatsPublishFailed {
                subject: format!("{}.>", subjects::EVENTS),
                source: Box::new(e),
            })?;

        info!(stream = streams::EVENTS, "NATS stream ready");
        Ok(())
    }

    /// Publish one envelope and wait for the JetStream ack
    pub async fn publish_event(&self, event: &GatewayEvent) -> Result<(), GatewayError> {
        let subject = subject_for(event);
        let payload = serde_json::to_vec(event).map_err(|source| GatewayError::SerializationFailed {
            event_type: event.event_type.clone(),
            shard_id: event.shard_id,
            source,
        })?;

        debug!(
            event_type = %event.event_type,
            subject,
            event_id = %event.event_id,
            "Publishing event"
        );

        let started = Instant::now();
        let published = async {
            self.jetstream
                .publish(subject.clone(), payload.into())
                .await?
                .await
        }
        .await;

        match published {
            Ok(ack) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                metrics::record_route_success(started.elapsed());
                debug!(subject, stream = %ack.stream, seq = ack.sequence, "Event published");
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_route_failure();
                warn!(subject, error = %e, "Failed to publish event");
                Err(GatewayError::NatsPublishFailed {
                    subject,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Flush pending publishes and stop reporting as connected
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "NATS flush on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> GatewayEvent {
        GatewayEvent {
            event_id: "test".to_string(),
            event_type: event_type.to_string(),
            shard_id: 0,
            sequence: 1,
            timestamp: 0,
            guild_id: None,
            channel_id: None,
            user_id: None,
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_subject_per_event_type() {
        assert_eq!(subject_for(&event("message_create")), "events.message_create");
        assert_eq!(subject_for(&event("guild.update")), "events.guild_update");
    }

    #[test]
    fn test_stream_covers_subjects() {
        assert_eq!(streams::EVENTS, "EVENTS");
        assert!(subject_for(&event("ready")).starts_with(subjects::EVENTS));
    }
}
