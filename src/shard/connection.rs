//! Shard connection
//!
//! [`ShardConnection`] is the caller-facing handle; the websocket itself is
//! owned by a runner task. The runner reconnects on its own for resumable
//! and reidentify closes, stops on fatal closes, and hands the shard back to
//! the orchestrator when the session can only be replaced.

use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::{EventBus, LifecycleKind};
use crate::gateway::codes::{ABNORMAL, CLIENT_RECONNECT, NO_STATUS};
use crate::gateway::{CloseRecovery, GatewayPayload, Inflater, RequestGuildMembers, ShardCommand, UpdatePresence};
use crate::metrics;
use crate::shard::session::{HeartbeatTick, SessionAction, ShardSession, ShardStatus};
use crate::shard::state::FleetState;
use crate::timer::Backoff;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use twilight_model::id::marker::{GuildMarker, UserMarker};
use twilight_model::id::Id;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code that ends the session server-side
const CLOSE_NORMAL: u16 = 1000;

/// Sent to the orchestrator when a shard's session cannot continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnRequest {
    pub shard_id: u32,
    /// Generation of the shard asking; stale requests are ignored
    pub generation: u64,
}

/// Everything needed to start one shard
#[derive(Debug, Clone)]
pub struct ShardSpawn {
    pub id: u32,
    pub total: u32,
    /// Base websocket URL from discovery, e.g. `wss://gateway.discord.gg`
    pub gateway_url: String,
    pub config: Arc<ShardConfig>,
    pub bus: EventBus,
    pub fleet: FleetState,
    pub generation: u64,
    pub respawn: Option<mpsc::UnboundedSender<RespawnRequest>>,
}

/// Handle to one running shard
#[derive(Debug)]
pub struct ShardConnection {
    id: u32,
    total: u32,
    generation: u64,
    session: Arc<Mutex<ShardSession>>,
    commands: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl ShardConnection {
    /// Start the runner task
    ///
    /// The receiver resolves once the first transport connection is open.
    pub fn spawn(spawn: ShardSpawn) -> Result<(Self, oneshot::Receiver<()>), GatewayError> {
        let gateway_url = build_url(&spawn.gateway_url, &spawn.config).map_err(|e| {
            GatewayError::Config(format!("invalid gateway url '{}': {e}", spawn.gateway_url))
        })?;

        let session = Arc::new(Mutex::new(ShardSession::new(spawn.id, spawn.total)));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        spawn.fleet.register(spawn.id);

        let runner = ShardRunner {
            id: spawn.id,
            generation: spawn.generation,
            config: spawn.config,
            gateway_url,
            session: Arc::clone(&session),
            commands: commands_rx,
            cancel: cancel.clone(),
            bus: spawn.bus,
            fleet: spawn.fleet,
            respawn: spawn.respawn,
            opened: Some(opened_tx),
        };
        tokio::spawn(runner.run());

        Ok((
            Self {
                id: spawn.id,
                total: spawn.total,
                generation: spawn.generation,
                session,
                commands: commands_tx,
                cancel,
            },
            opened_rx,
        ))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> ShardStatus {
        self.session.lock().status()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.session.lock().sequence()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().session_id().map(str::to_owned)
    }

    /// Bot user id reported by READY
    pub fn user_id(&self) -> Option<Id<UserMarker>> {
        self.session.lock().user_id()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.session.lock().latency()
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_connected()
    }

    /// The fatal close that halted this shard, if any
    pub fn fatal_error(&self) -> Option<GatewayError> {
        let code = self.session.lock().fatal_code()?;
        Some(GatewayError::ShardFatal {
            shard_id: self.id,
            code,
        })
    }

    /// Disconnected and replaced, or shut down
    pub fn is_superseded(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Encode and send a command on the open connection
    pub fn send(&self, command: &ShardCommand) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected { shard_id: self.id });
        }
        let frame = command.encode()?;
        trace!(shard_id = self.id, frame = %frame, "Queueing command");
        self.commands
            .send(frame)
            .map_err(|_| GatewayError::NotConnected { shard_id: self.id })
    }

    pub fn request_guild_members(
        &self,
        guild_id: Id<GuildMarker>,
        options: RequestGuildMembers,
    ) -> Result<(), GatewayError> {
        self.send(&ShardCommand::RequestGuildMembers { guild_id, options })
    }

    pub fn update_presence(&self, presence: UpdatePresence) -> Result<(), GatewayError> {
        self.send(&ShardCommand::UpdatePresence(presence))
    }

    /// Close the connection and stop the heartbeat; any reconnect in
    /// progress is abandoned
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            info!(shard_id = self.id, generation = self.generation, "Disconnecting shard");
            self.cancel.cancel();
        }
    }
}

/// Append the connection parameters to a gateway URL
pub fn build_url(base: &str, config: &ShardConfig) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .clear()
            .append_pair("v", &config.gateway_version.to_string())
            .append_pair("encoding", "json");
        if config.compress {
            query.append_pair("compress", "zlib-stream");
        }
    }
    Ok(url)
}

enum Exit {
    Reconnect,
    Respawn,
    Fatal,
    Cancelled,
}

struct ShardRunner {
    id: u32,
    generation: u64,
    config: Arc<ShardConfig>,
    gateway_url: Url,
    session: Arc<Mutex<ShardSession>>,
    commands: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    bus: EventBus,
    fleet: FleetState,
    respawn: Option<mpsc::UnboundedSender<RespawnRequest>>,
    opened: Option<oneshot::Sender<()>>,
}

impl ShardRunner {
    async fn run(mut self) {
        let mut backoff = Backoff::default();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let url = self.connect_url();
            self.session.lock().set_status(ShardStatus::Connecting);
            self.sync_status();
            debug!(shard_id = self.id, url = %url, "Opening gateway connection");

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect_async(url.as_str()) => result,
            };

            let ws = match connected {
                Ok((ws, _)) => ws,
                Err(source) => {
                    let error = GatewayError::Connect {
                        shard_id: self.id,
                        source: Box::new(source),
                    };
                    let delay = backoff.next_delay();
                    warn!(shard_id = self.id, error = %error, ?delay, "Gateway connect failed, retrying");
                    metrics::record_error(self.id, error.error_type_label());
                    if self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            if let Some(opened) = self.opened.take() {
                let _ = opened.send(());
            }

            let (exit, reached_active) = self.drive(ws).await;
            match exit {
                Exit::Reconnect => {
                    if reached_active {
                        backoff.reset();
                    } else if self.pause(backoff.next_delay()).await {
                        break;
                    }
                }
                Exit::Respawn => {
                    self.request_respawn();
                    break;
                }
                Exit::Fatal | Exit::Cancelled => break,
            }
        }

        self.session.lock().on_disconnected();
        if !self.cancel.is_cancelled() {
            self.sync_status();
        }
        debug!(shard_id = self.id, generation = self.generation, "Shard runner stopped");
    }

    /// One transport connection, from open to close
    async fn drive(&mut self, mut ws: WsStream) -> (Exit, bool) {
        // Commands queued for the previous connection are stale
        while self.commands.try_recv().is_ok() {}

        self.session.lock().on_open();
        self.sync_status();
        self.bus.publish_lifecycle(self.id, LifecycleKind::Connected);

        let mut inflater = self.config.compress.then(Inflater::new);
        let mut heartbeat: Option<Interval> = None;
        let mut reached_active = false;

        let exit = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    close(&mut ws, CLOSE_NORMAL).await;
                    break Exit::Cancelled;
                }

                _ = next_tick(&mut heartbeat) => {
                    let tick = self.session.lock().on_heartbeat_tick();
                    match tick {
                        Ok(HeartbeatTick::Send(frame)) => {
                            if let Some(exit) = self.send(&mut ws, frame).await {
                                break exit;
                            }
                        }
                        Ok(HeartbeatTick::Zombie) => {
                            break self.reconnect(&mut ws).await;
                        }
                        Err(e) => self.record(&e, "Failed to encode heartbeat"),
                    }
                }

                Some(frame) = self.commands.recv() => {
                    if let Some(exit) = self.send(&mut ws, frame).await {
                        break exit;
                    }
                }

                message = ws.next() => {
                    let bytes = match message {
                        None => break self.on_close(ABNORMAL),
                        Some(Err(e)) => {
                            warn!(shard_id = self.id, error = %e, "Gateway read failed");
                            break self.on_close(ABNORMAL);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map_or(NO_STATUS, |f| u16::from(f.code));
                            break self.on_close(code);
                        }
                        Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(Message::Binary(data))) => match inflater.as_mut() {
                            None => data.to_vec(),
                            Some(inflater) => match inflater.push(&data) {
                                Ok(Some(inflated)) => inflated,
                                Ok(None) => continue,
                                Err(source) => {
                                    let error = GatewayError::Decompress { shard_id: self.id, source };
                                    self.record(&error, "Dropping connection with corrupt compression context");
                                    break self.reconnect(&mut ws).await;
                                }
                            },
                        },
                        Some(Ok(_)) => continue,
                    };

                    if let Some(exit) = self
                        .process(&mut ws, &bytes, &mut heartbeat, &mut reached_active)
                        .await
                    {
                        break exit;
                    }
                }
            }
        };

        (exit, reached_active)
    }

    async fn process(
        &mut self,
        ws: &mut WsStream,
        bytes: &[u8],
        heartbeat: &mut Option<Interval>,
        reached_active: &mut bool,
    ) -> Option<Exit> {
        let payload = match GatewayPayload::from_slice(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                self.record(&e, "Skipping undecodable payload");
                return None;
            }
        };
        trace!(
            shard_id = self.id,
            op = payload.op,
            sequence = ?payload.s,
            event = ?payload.t,
            "Received payload"
        );

        let action = self.session.lock().handle(payload);
        let action = match action {
            Ok(action) => action,
            Err(e) => {
                self.record(&e, "Failed to apply payload");
                return None;
            }
        };

        match action {
            SessionAction::Ignore => None,
            SessionAction::Dispatch { event, lifecycle } => {
                metrics::record_dispatch(self.id, &event.name);
                self.fleet.record_event(self.id);
                if let Some(kind) = lifecycle {
                    *reached_active = true;
                    self.sync_status();
                    self.bus.publish_lifecycle(self.id, kind);
                }
                self.bus.publish(event);
                None
            }
            SessionAction::Hello { interval } => {
                let interval = interval.max(Duration::from_millis(1));
                let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *heartbeat = Some(timer);
                debug!(shard_id = self.id, ?interval, "Heartbeat started");

                let handshake = self.session.lock().handshake(&self.config);
                self.sync_status();
                match handshake {
                    Ok(frame) => self.send(ws, frame).await,
                    Err(e) => {
                        self.record(&e, "Failed to encode handshake");
                        Some(self.reconnect(ws).await)
                    }
                }
            }
            SessionAction::HeartbeatNow => {
                let frame = self.session.lock().heartbeat_frame();
                match frame {
                    Ok(frame) => self.send(ws, frame).await,
                    Err(e) => {
                        self.record(&e, "Failed to encode heartbeat");
                        None
                    }
                }
            }
            SessionAction::HeartbeatAcked { latency } => {
                self.fleet.record_heartbeat(self.id, latency);
                if let Some(latency) = latency {
                    trace!(shard_id = self.id, ?latency, "Heartbeat acknowledged");
                    metrics::record_heartbeat(self.id, latency);
                }
                None
            }
            SessionAction::Reconnect => Some(self.reconnect(ws).await),
            SessionAction::Respawn => {
                close(ws, CLOSE_NORMAL).await;
                Some(Exit::Respawn)
            }
        }
    }

    async fn send(&mut self, ws: &mut WsStream, frame: String) -> Option<Exit> {
        trace!(shard_id = self.id, frame = %frame, "Sending frame");
        match ws.send(Message::text(frame)).await {
            Ok(()) => None,
            Err(e) => {
                warn!(shard_id = self.id, error = %e, "Gateway write failed");
                Some(self.on_close(ABNORMAL))
            }
        }
    }

    /// Drop the connection ourselves and come back with a Resume
    async fn reconnect(&mut self, ws: &mut WsStream) -> Exit {
        close(ws, CLIENT_RECONNECT).await;
        self.session.lock().on_client_reconnect();
        self.sync_status();

        let recovery = CloseRecovery::ResumeAndReconnect;
        metrics::record_reconnect(self.id, recovery);
        self.bus.publish_lifecycle(
            self.id,
            LifecycleKind::Disconnected {
                code: CLIENT_RECONNECT,
                recovery,
            },
        );
        Exit::Reconnect
    }

    /// Connection closed by the server or the transport
    fn on_close(&mut self, code: u16) -> Exit {
        let recovery = self.session.lock().on_close(code);
        self.sync_status();
        self.bus
            .publish_lifecycle(self.id, LifecycleKind::Disconnected { code, recovery });

        if recovery == CloseRecovery::Fatal {
            let error = GatewayError::ShardFatal {
                shard_id: self.id,
                code,
            };
            error!(shard_id = self.id, code, error = %error, "Shard halted");
            metrics::record_error(self.id, error.error_type_label());
            self.bus.publish_lifecycle(self.id, LifecycleKind::Fatal { code });
            return Exit::Fatal;
        }

        info!(
            shard_id = self.id,
            code,
            recovery = recovery.as_str(),
            "Shard disconnected"
        );
        metrics::record_reconnect(self.id, recovery);
        Exit::Reconnect
    }

    fn request_respawn(&self) {
        let Some(respawn) = &self.respawn else {
            warn!(shard_id = self.id, "Session lost and no orchestrator to respawn the shard");
            return;
        };
        info!(shard_id = self.id, generation = self.generation, "Requesting shard respawn");
        let _ = respawn.send(RespawnRequest {
            shard_id: self.id,
            generation: self.generation,
        });
    }

    /// Resume URL when resuming, otherwise the discovered gateway URL
    fn connect_url(&self) -> Url {
        let resume_url = {
            let session = self.session.lock();
            if session.can_resume() {
                session.resume_url().map(str::to_owned)
            } else {
                None
            }
        };
        resume_url
            .and_then(|raw| build_url(&raw, &self.config).ok())
            .unwrap_or_else(|| self.gateway_url.clone())
    }

    fn sync_status(&self) {
        let status = self.session.lock().status();
        self.fleet.set_status(self.id, status);
    }

    fn record(&self, error: &GatewayError, message: &'static str) {
        warn!(shard_id = self.id, error = %error, "{message}");
        metrics::record_error(self.id, error.error_type_label());
    }

    /// Sleep unless cancelled first; true when cancelled
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn close(ws: &mut WsStream, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: String::new().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        trace!(error = %e, code, "Close handshake failed");
    }
}
