//! Shard protocol state machine
//!
//! Pure state: no I/O, no timers. The connection runner feeds decoded
//! payloads, heartbeat ticks and close codes in, and performs whatever
//! [`SessionAction`] comes back.

use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::{DispatchEvent, LifecycleKind};
use crate::gateway::payload::{self, GatewayPayload, Hello, Identify, IdentifyProperties, Ready, Resume};
use crate::gateway::{classify_close, CloseRecovery, OpCode};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use twilight_model::id::marker::UserMarker;
use twilight_model::id::Id;

/// Connection status of a single shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Active,
    /// Closed with a fatal code; never reconnects on its own
    Fatal,
}

impl ShardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Active => "active",
            Self::Fatal => "fatal",
        }
    }

    /// Receiving events
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Receiving events or about to continue an existing session
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Active | Self::Resuming)
    }
}

/// What the connection runner must do after a payload
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    Ignore,
    /// Forward to the event sink, with a lifecycle notice for READY/RESUMED
    Dispatch {
        event: DispatchEvent,
        lifecycle: Option<LifecycleKind>,
    },
    /// Start heartbeating at `interval` and send the handshake
    Hello { interval: Duration },
    /// Server asked for a heartbeat right away
    HeartbeatNow,
    HeartbeatAcked { latency: Option<Duration> },
    /// Drop the connection and reconnect; the session is kept
    Reconnect,
    /// Session cannot continue; the orchestrator must replace this shard
    Respawn,
}

/// Outcome of a heartbeat tick
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatTick {
    /// Send this heartbeat frame
    Send(String),
    /// The previous heartbeat was never acknowledged
    Zombie,
}

/// Per-connection protocol state of one shard
#[derive(Debug)]
pub struct ShardSession {
    id: u32,
    total: u32,
    sequence: Option<u64>,
    session_id: Option<String>,
    resume_url: Option<String>,
    /// Bot user this session is logged in as
    user_id: Option<Id<UserMarker>>,
    /// `[shard_id, total]` reported by READY
    ready_shard: Option<[u32; 2]>,
    heartbeat_acked: bool,
    heartbeat_sent_at: Option<Instant>,
    latency: Option<Duration>,
    status: ShardStatus,
    connected: bool,
    fatal_code: Option<u16>,
}

impl ShardSession {
    pub fn new(id: u32, total: u32) -> Self {
        Self {
            id,
            total,
            sequence: None,
            session_id: None,
            resume_url: None,
            user_id: None,
            ready_shard: None,
            heartbeat_acked: true,
            heartbeat_sent_at: None,
            latency: None,
            status: ShardStatus::Disconnected,
            connected: false,
            fatal_code: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// `resume_gateway_url` from READY, used for resume connections
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// Bot user id from the last READY
    pub fn user_id(&self) -> Option<Id<UserMarker>> {
        self.user_id
    }

    /// Shard pair from the last READY
    pub fn ready_shard(&self) -> Option<[u32; 2]> {
        self.ready_shard
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    /// Last heartbeat round trip
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn fatal_code(&self) -> Option<u16> {
        self.fatal_code
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    pub(crate) fn set_status(&mut self, status: ShardStatus) {
        self.status = status;
    }

    /// Transport is open; wait for Hello
    pub fn on_open(&mut self) {
        self.connected = true;
        self.heartbeat_acked = true;
        self.heartbeat_sent_at = None;
        self.status = ShardStatus::AwaitingHello;
    }

    /// Apply one inbound payload
    pub fn handle(&mut self, payload: GatewayPayload) -> Result<SessionAction, GatewayError> {
        let Some(op) = payload.opcode() else {
            debug!(shard_id = self.id, op = payload.op, "Ignoring unknown opcode");
            return Ok(SessionAction::Ignore);
        };

        match op {
            OpCode::Dispatch => self.on_dispatch(payload),
            OpCode::Heartbeat => Ok(SessionAction::HeartbeatNow),
            OpCode::HeartbeatAck => {
                self.heartbeat_acked = true;
                self.latency = self.heartbeat_sent_at.take().map(|sent| sent.elapsed());
                Ok(SessionAction::HeartbeatAcked {
                    latency: self.latency,
                })
            }
            OpCode::Hello => {
                let hello: Hello = serde_json::from_value(payload.d).map_err(GatewayError::Decode)?;
                Ok(SessionAction::Hello {
                    interval: Duration::from_millis(hello.heartbeat_interval),
                })
            }
            OpCode::Reconnect => {
                info!(shard_id = self.id, "Server requested reconnect");
                Ok(self.reconnect_or_respawn())
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                warn!(shard_id = self.id, resumable, "Session invalidated");
                if !resumable {
                    self.clear_session();
                }
                Ok(self.reconnect_or_respawn())
            }
            _ => {
                debug!(shard_id = self.id, ?op, "Ignoring send-only opcode");
                Ok(SessionAction::Ignore)
            }
        }
    }

    fn on_dispatch(&mut self, payload: GatewayPayload) -> Result<SessionAction, GatewayError> {
        if let Some(seq) = payload.s {
            self.sequence = Some(self.sequence.map_or(seq, |current| current.max(seq)));
        }

        let name = payload.t.unwrap_or_default();
        let lifecycle = match name.as_str() {
            "READY" => {
                let ready: Ready =
                    serde_json::from_value(payload.d.clone()).map_err(GatewayError::Decode)?;
                info!(shard_id = self.id, session_id = %ready.session_id, "Shard ready");
                if let Some([id, total]) = ready.shard {
                    if id != self.id || total != self.total {
                        warn!(
                            shard_id = self.id,
                            total = self.total,
                            ready_shard = ?[id, total],
                            "READY reports a different shard than identified"
                        );
                    }
                }
                self.session_id = Some(ready.session_id.clone());
                self.resume_url = ready.resume_gateway_url;
                self.user_id = ready.user.map(|user| user.id).or(self.user_id);
                self.ready_shard = ready.shard;
                self.status = ShardStatus::Active;
                Some(LifecycleKind::Ready {
                    session_id: ready.session_id,
                })
            }
            "RESUMED" => {
                info!(shard_id = self.id, sequence = ?self.sequence, "Shard resumed");
                self.status = ShardStatus::Active;
                Some(LifecycleKind::Resumed)
            }
            _ => None,
        };

        Ok(SessionAction::Dispatch {
            event: DispatchEvent {
                shard_id: self.id,
                name,
                sequence: self.sequence.unwrap_or_default(),
                data: payload.d,
            },
            lifecycle,
        })
    }

    fn reconnect_or_respawn(&self) -> SessionAction {
        if self.can_resume() {
            SessionAction::Reconnect
        } else {
            SessionAction::Respawn
        }
    }

    /// Identify or Resume frame for a fresh connection
    pub fn handshake(&mut self, config: &ShardConfig) -> Result<String, GatewayError> {
        if self.can_resume() {
            let resume = self.resume(config)?;
            self.status = ShardStatus::Resuming;
            payload::encode(OpCode::Resume, &resume)
        } else {
            self.status = ShardStatus::Identifying;
            payload::encode(OpCode::Identify, &self.identify(config))
        }
    }

    pub fn identify(&self, config: &ShardConfig) -> Identify {
        Identify {
            token: config.token.clone(),
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold: config.large_threshold,
            shard: [self.id, self.total],
            intents: config.intents.bits(),
            presence: None,
        }
    }

    pub fn resume(&self, config: &ShardConfig) -> Result<Resume, GatewayError> {
        let session_id = self
            .session_id
            .clone()
            .ok_or(GatewayError::NoSession { shard_id: self.id })?;
        Ok(Resume {
            token: config.token.clone(),
            session_id,
            seq: self.sequence.unwrap_or_default(),
        })
    }

    /// Heartbeat frame carrying the last sequence
    pub fn heartbeat_frame(&mut self) -> Result<String, GatewayError> {
        self.heartbeat_acked = false;
        self.heartbeat_sent_at = Some(Instant::now());
        payload::encode(OpCode::Heartbeat, &self.sequence)
    }

    /// Periodic heartbeat; a missing ack means the connection is dead
    pub fn on_heartbeat_tick(&mut self) -> Result<HeartbeatTick, GatewayError> {
        if !self.heartbeat_acked {
            warn!(shard_id = self.id, "Heartbeat not acknowledged, connection is zombied");
            return Ok(HeartbeatTick::Zombie);
        }
        self.heartbeat_frame().map(HeartbeatTick::Send)
    }

    /// Classify a close and update the session to match
    pub fn on_close(&mut self, code: u16) -> CloseRecovery {
        let recovery = classify_close(code);
        self.connected = false;
        self.heartbeat_sent_at = None;

        match recovery {
            CloseRecovery::ResumeAndReconnect => self.status = self.reconnect_status(),
            CloseRecovery::ReconnectWithoutResume => {
                self.clear_session();
                self.status = ShardStatus::Connecting;
            }
            CloseRecovery::Fatal => {
                self.fatal_code = Some(code);
                self.status = ShardStatus::Fatal;
            }
        }
        recovery
    }

    /// This client dropped the connection to reconnect (zombie, op 7)
    pub fn on_client_reconnect(&mut self) {
        self.connected = false;
        self.heartbeat_sent_at = None;
        self.status = self.reconnect_status();
    }

    fn reconnect_status(&self) -> ShardStatus {
        if self.can_resume() {
            ShardStatus::Resuming
        } else {
            ShardStatus::Connecting
        }
    }

    /// Transport is gone without a close code of interest (shutdown, replace)
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.heartbeat_sent_at = None;
        if self.status != ShardStatus::Fatal {
            self.status = ShardStatus::Disconnected;
        }
    }

    fn clear_session(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.sequence = None;
    }
}
