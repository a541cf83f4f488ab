//! Gateway payloads and the JSON wire codec

use crate::error::GatewayError;
use crate::gateway::opcode::OpCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use twilight_model::id::marker::{GuildMarker, UserMarker};
use twilight_model::id::Id;

/// Decoded inbound frame
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(bytes).map_err(GatewayError::Decode)
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }
}

/// `d` of a Hello frame
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// Fields of the READY dispatch the shard keeps
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub user: Option<ReadyUser>,
    /// `[shard_id, total_shards]` the session was opened for
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

/// The bot's own user from READY
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub id: Id<UserMarker>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
struct Outbound<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

/// Encode an outbound frame as a JSON text payload
pub fn encode<T: Serialize>(op: OpCode, data: &T) -> Result<String, GatewayError> {
    serde_json::to_string(&Outbound { op: op.code(), d: data })
        .map_err(|source| GatewayError::Encode { op: op.code(), source })
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify (opcode 2)
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    /// Payload compression is never requested; transport compression is used instead
    pub compress: bool,
    pub large_threshold: u32,
    pub shard: [u32; 2],
    pub intents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<UpdatePresence>,
}

/// Resume (opcode 6)
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Request guild members (opcode 8)
///
/// With neither `query` nor `user_ids` set, `query` defaults to `""`
/// (all members; requires the GUILD_MEMBERS intent).
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestGuildMembers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub presences: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<Id<UserMarker>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Serialize)]
struct GuildMembersRequest<'a> {
    guild_id: Id<GuildMarker>,
    #[serde(flatten)]
    options: &'a RequestGuildMembers,
}

/// Presence update (opcode 3)
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePresence {
    pub since: Option<u64>,
    pub activities: Vec<Value>,
    pub status: String,
    pub afk: bool,
}

impl UpdatePresence {
    pub fn online() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: "online".to_string(),
            afk: false,
        }
    }
}

/// Commands a caller can send through a shard
#[derive(Debug, Clone)]
pub enum ShardCommand {
    RequestGuildMembers {
        guild_id: Id<GuildMarker>,
        options: RequestGuildMembers,
    },
    UpdatePresence(UpdatePresence),
}

impl ShardCommand {
    pub fn encode(&self) -> Result<String, GatewayError> {
        match self {
            Self::RequestGuildMembers { guild_id, options } => {
                let mut options = options.clone();
                if options.query.is_none() && options.user_ids.is_empty() {
                    options.query = Some(String::new());
                }
                encode(
                    OpCode::RequestGuildMembers,
                    &GuildMembersRequest {
                        guild_id: *guild_id,
                        options: &options,
                    },
                )
            }
            Self::UpdatePresence(presence) => encode(OpCode::PresenceUpdate, presence),
        }
    }
}
