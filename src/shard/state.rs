//! Fleet state tracking
//!
//! Read-side view of every shard the orchestrator runs, used by the
//! readiness endpoint and the metrics gauges.

use crate::shard::session::ShardStatus;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// State for a single shard
#[derive(Debug)]
struct ShardEntry {
    status: ShardStatus,
    events_received: AtomicU64,
    latency: Option<Duration>,
    last_heartbeat: Option<Instant>,
    connected_at: Option<Instant>,
}

impl Default for ShardEntry {
    fn default() -> Self {
        Self {
            status: ShardStatus::Disconnected,
            events_received: AtomicU64::new(0),
            latency: None,
            last_heartbeat: None,
            connected_at: None,
        }
    }
}

/// Point-in-time copy of one shard's state
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub events_received: u64,
    pub latency: Option<Duration>,
    pub last_heartbeat: Option<Instant>,
    pub connected_at: Option<Instant>,
}

/// Shared state across all shards of one orchestrator
#[derive(Debug, Clone, Default)]
pub struct FleetState {
    shards: Arc<DashMap<u32, ShardEntry>>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a shard id; existing counters are kept
    pub fn register(&self, shard_id: u32) {
        self.shards.entry(shard_id).or_insert_with(ShardEntry::default);
    }

    pub fn set_status(&self, shard_id: u32, status: ShardStatus) {
        let mut entry = self.shards.entry(shard_id).or_insert_with(ShardEntry::default);
        entry.status = status;
        if status.is_ready() {
            entry.connected_at.get_or_insert_with(Instant::now);
        } else if !status.is_healthy() {
            entry.connected_at = None;
        }
    }

    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        if let Some(mut entry) = self.shards.get_mut(&shard_id) {
            entry.last_heartbeat = Some(Instant::now());
            if latency.is_some() {
                entry.latency = latency;
            }
        }
    }

    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.shards.get(&shard_id).map(|e| e.status)
    }

    pub fn snapshot(&self, shard_id: u32) -> Option<ShardSnapshot> {
        self.shards.get(&shard_id).map(|e| ShardSnapshot {
            shard_id,
            status: e.status,
            events_received: e.events_received.load(Ordering::Relaxed),
            latency: e.latency,
            last_heartbeat: e.last_heartbeat,
            connected_at: e.connected_at,
        })
    }

    /// Snapshots ordered by shard id
    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        let mut ids: Vec<u32> = self.shards.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.snapshot(id)).collect()
    }

    pub fn total_events_received(&self) -> u64 {
        self.shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn ready_shards(&self) -> usize {
        self.shards.iter().filter(|e| e.status.is_ready()).count()
    }

    /// Ready or resuming
    pub fn healthy_shards(&self) -> usize {
        self.shards.iter().filter(|e| e.status.is_healthy()).count()
    }

    pub fn fatal_shards(&self) -> usize {
        self.shards
            .iter()
            .filter(|e| e.status == ShardStatus::Fatal)
            .count()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// At least one shard is ready
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    pub fn is_healthy(&self) -> bool {
        self.shard_count() > 0 && self.healthy_shards() == self.shard_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_follow_status() {
        let fleet = FleetState::new();
        for id in 0..3 {
            fleet.register(id);
        }
        assert!(!fleet.is_ready());

        fleet.set_status(0, ShardStatus::Active);
        fleet.set_status(1, ShardStatus::Resuming);
        fleet.set_status(2, ShardStatus::Fatal);

        assert_eq!(fleet.ready_shards(), 1);
        assert_eq!(fleet.healthy_shards(), 2);
        assert_eq!(fleet.fatal_shards(), 1);
        assert!(fleet.is_ready());
        assert!(!fleet.is_healthy());
    }

    #[test]
    fn test_register_keeps_counters() {
        let fleet = FleetState::new();
        fleet.register(4);
        fleet.record_event(4);
        fleet.record_event(4);
        fleet.register(4);
        assert_eq!(fleet.snapshot(4).unwrap().events_received, 2);
        assert_eq!(fleet.total_events_received(), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_last_known_latency() {
        let fleet = FleetState::new();
        fleet.register(0);
        fleet.record_heartbeat(0, Some(Duration::from_millis(40)));
        fleet.record_heartbeat(0, None);

        let snapshot = fleet.snapshot(0).unwrap();
        assert_eq!(snapshot.latency, Some(Duration::from_millis(40)));
        assert!(snapshot.last_heartbeat.is_some());
    }

    #[test]
    fn test_snapshots_are_ordered() {
        let fleet = FleetState::new();
        for id in [5, 1, 3] {
            fleet.register(id);
        }
        let ids: Vec<u32> = fleet.snapshots().iter().map(|s| s.shard_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
