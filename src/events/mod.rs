//! Event delivery
//!
//! Typed broadcast channels instead of a name-keyed emitter. Every dispatch
//! is delivered twice: to subscribers of its event name and to the
//! catch-all stream. Shard lifecycle notices travel on their own channel.

pub mod serialize;

pub use serialize::{serialize_event, GatewayEvent};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::gateway::CloseRecovery;

/// One dispatch received by a shard
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub shard_id: u32,
    /// Event name, e.g. `MESSAGE_CREATE`
    pub name: String,
    pub sequence: u64,
    pub data: serde_json::Value,
}

/// Shard lifecycle transitions
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleKind {
    /// Transport opened (before Hello)
    Connected,
    /// READY received; a new session started
    Ready { session_id: String },
    /// RESUMED received; the previous session continues
    Resumed,
    /// Connection closed; `recovery` says what happens next
    Disconnected { code: u16, recovery: CloseRecovery },
    /// Shard halted; it will not reconnect on its own
    Fatal { code: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardLifecycle {
    pub shard_id: u32,
    pub kind: LifecycleKind,
}

/// Fan-out hub for dispatches and lifecycle notices
///
/// Receivers that fall more than `capacity` events behind observe
/// `RecvError::Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Debug)]
struct EventBusInner {
    capacity: usize,
    all: broadcast::Sender<Arc<DispatchEvent>>,
    named: DashMap<String, broadcast::Sender<Arc<DispatchEvent>>>,
    lifecycle: broadcast::Sender<ShardLifecycle>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        let (lifecycle, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventBusInner {
                capacity,
                all,
                named: DashMap::new(),
                lifecycle,
            }),
        }
    }

    /// Catch-all stream of every dispatch from every shard
    pub fn subscribe_all(&self) -> broadcast::Receiver<Arc<DispatchEvent>> {
        self.inner.all.subscribe()
    }

    /// Dispatches with one event name only
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<Arc<DispatchEvent>> {
        self.inner
            .named
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ShardLifecycle> {
        self.inner.lifecycle.subscribe()
    }

    /// Deliver to the named channel, then the catch-all
    pub fn publish(&self, event: DispatchEvent) {
        let event = Arc::new(event);
        if let Some(named) = self.inner.named.get(&event.name) {
            let _ = named.send(Arc::clone(&event));
        }
        let _ = self.inner.all.send(event);
    }

    pub fn publish_lifecycle(&self, shard_id: u32, kind: LifecycleKind) {
        let _ = self.inner.lifecycle.send(ShardLifecycle { shard_id, kind });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_BUFFER)
    }
}
