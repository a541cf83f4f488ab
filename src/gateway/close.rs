//! Close-code classification
//!
//! Every close code maps to exactly one recovery class. The table is part of
//! the remote protocol contract.

/// Gateway and websocket close codes referenced by the classifier
pub mod codes {
    pub const NO_CODE: u16 = 0;
    pub const GOING_AWAY: u16 = 1001;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;

    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQUENCE: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;

    /// Sent by this client when it drops a connection it intends to resume.
    /// Any non-1000/1001 code keeps the session alive server-side.
    pub const CLIENT_RECONNECT: u16 = 4900;
}

/// How a shard recovers from a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRecovery {
    /// Reconnect and send Resume with the preserved session
    ResumeAndReconnect,
    /// Reconnect with a cleared session and send Identify
    ReconnectWithoutResume,
    /// Halt the shard; surface the error to the orchestrator
    Fatal,
}

impl CloseRecovery {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResumeAndReconnect => "resume",
            Self::ReconnectWithoutResume => "reidentify",
            Self::Fatal => "fatal",
        }
    }
}

/// Classify a close code; unknown codes reconnect without resuming
pub fn classify_close(code: u16) -> CloseRecovery {
    use codes::*;

    match code {
        NO_CODE | GOING_AWAY | NO_STATUS | ABNORMAL | UNKNOWN_ERROR => {
            CloseRecovery::ResumeAndReconnect
        }
        UNKNOWN_OPCODE | DECODE_ERROR | INVALID_SEQUENCE | RATE_LIMITED | SESSION_TIMED_OUT => {
            CloseRecovery::ReconnectWithoutResume
        }
        INVALID_SHARD | SHARDING_REQUIRED | INVALID_INTENTS | DISALLOWED_INTENTS => CloseRecovery::Fatal,
        _ => CloseRecovery::ReconnectWithoutResume,
    }
}
