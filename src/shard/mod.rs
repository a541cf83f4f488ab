//! Shard management
//!
//! A shard is one gateway session covering a partition of guilds. The
//! orchestrator spawns and supervises them; each connection runs the
//! protocol state machine in `ShardSession`.

mod connection;
mod orchestrator;
mod session;
mod state;

pub use connection::{build_url, RespawnRequest, ShardConnection, ShardSpawn};
pub use orchestrator::{
    shard_for_entity, GatewayInfo, SessionStartLimit, ShardOrchestrator, OPEN_TIMEOUT,
};
pub use session::{HeartbeatTick, SessionAction, ShardSession, ShardStatus};
pub use state::{FleetState, ShardSnapshot};
