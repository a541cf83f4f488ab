//! Event serialization for message broker
//!
//! Converts shard dispatches to JSON envelopes for NATS publishing.

use crate::events::DispatchEvent;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Dispatches that only matter to the shard itself
const LOCAL_ONLY: &[&str] = &["READY", "RESUMED"];

/// Generic gateway event payload
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_id: String,
    pub event_type: String,
    pub shard_id: u32,
    pub sequence: u64,
    pub timestamp: u64,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub data: Value,
}

/// Serialize a dispatch to a GatewayEvent envelope
///
/// Returns None for session bookkeeping events that are not forwarded.
pub fn serialize_event(event: &DispatchEvent) -> Option<GatewayEvent> {
    if LOCAL_ONLY.contains(&event.name.as_str()) {
        return None;
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let user_id = string_field(&event.data, &["user", "id"])
        .or_else(|| string_field(&event.data, &["author", "id"]))
        .or_else(|| string_field(&event.data, &["member", "user", "id"]))
        .or_else(|| string_field(&event.data, &["user_id"]));

    Some(GatewayEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type: event_type(&event.name),
        shard_id: event.shard_id,
        sequence: event.sequence,
        timestamp,
        guild_id: string_field(&event.data, &["guild_id"]),
        channel_id: string_field(&event.data, &["channel_id"]),
        user_id,
        data: event.data.clone(),
    })
}

/// `GUILD_MEMBER_ADD` → `guild_member_add`
pub fn event_type(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn string_field(data: &Value, path: &[&str]) -> Option<String> {
    let mut node = data;
    for key in path {
        node = node.get(key)?;
    }
    node.as_str().map(str::to_owned)
}
