//! Arrakis Shardline - Discord gateway sharding and rate-limited REST
//!
//! - `rest`: per-route request queues migrated onto server buckets, with a
//!   global cooldown owned by each coordinator
//! - `gateway`: wire protocol (opcodes, payloads, close codes, zlib-stream)
//! - `shard`: protocol state machine, connection runner and orchestrator
//! - `events`: typed dispatch and lifecycle channels
//!
//! `nats` and `health` back the daemon binary.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod pipeline;
pub mod rest;
pub mod shard;
pub mod timer;

pub use config::{GatewayConfig, RestConfig, ShardConfig};
pub use error::{FieldError, GatewayError, RestError};
pub use events::{DispatchEvent, EventBus, LifecycleKind, ShardLifecycle};
pub use rest::{RateLimitCoordinator, RestRequest, RestResponse};
pub use shard::{ShardConnection, ShardOrchestrator, ShardStatus};
