//! Gateway wire protocol
//!
//! Opcodes, payload shapes, close-code classification and transport
//! decompression. Connection handling lives in [`crate::shard`].

pub mod close;
pub mod inflater;
pub mod opcode;
pub mod payload;

pub use close::{classify_close, codes, CloseRecovery};
pub use inflater::Inflater;
pub use opcode::OpCode;
pub use payload::{
    GatewayPayload, Hello, Identify, IdentifyProperties, Ready, ReadyUser, RequestGuildMembers, Resume,
    ShardCommand, UpdatePresence,
};
