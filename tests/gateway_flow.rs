//! Shard lifecycle against an in-process websocket gateway
//!
//! Each test scripts the server side of one or more connections and checks
//! what the shard sends back and publishes.

use arrakis_shardline::config::{RestConfig, ShardConfig};
use arrakis_shardline::error::GatewayError;
use arrakis_shardline::events::{EventBus, LifecycleKind, ShardLifecycle};
use arrakis_shardline::gateway::{CloseRecovery, RequestGuildMembers, UpdatePresence};
use arrakis_shardline::rest::RateLimitCoordinator;
use arrakis_shardline::shard::{FleetState, RespawnRequest, ShardConnection, ShardOrchestrator, ShardSpawn, ShardStatus};

use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use twilight_model::gateway::Intents;
use twilight_model::id::Id;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);
const BOT_USER_ID: &str = "80351110224678912";

/// Accepts shard connections and hands them to the test in order
struct MockGateway {
    url: String,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockGateway {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, accepted) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let at = Instant::now();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut uri = String::new();
                    let callback = |request: &Request, response: Response| {
                        uri = request.uri().to_string();
                        Ok::<_, ErrorResponse>(response)
                    };
                    if let Ok(ws) = accept_hdr_async(stream, callback).await {
                        let _ = tx.send(ServerConn {
                            uri,
                            at,
                            ws,
                            deflate: None,
                        });
                    }
                });
            }
        });

        Self { url, accepted }
    }

    async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("shard never connected")
            .expect("gateway listener stopped")
    }

    /// True when no connection arrives within `window`
    async fn stays_quiet(&mut self, window: Duration) -> bool {
        timeout(window, self.accepted.recv()).await.is_err()
    }
}

/// Server end of one shard connection
struct ServerConn {
    uri: String,
    at: Instant,
    ws: WebSocketStream<TcpStream>,
    deflate: Option<Compress>,
}

impl ServerConn {
    async fn send(&mut self, value: Value) {
        match self.deflate.as_mut() {
            None => self.ws.send(Message::text(value.to_string())).await.unwrap(),
            Some(deflate) => {
                let input = value.to_string().into_bytes();
                let mut output = Vec::with_capacity(input.len() + 1024);
                deflate
                    .compress_vec(&input, &mut output, FlushCompress::Sync)
                    .unwrap();
                // Split every message so the shard has to reassemble it
                let (head, tail) = output.split_at(output.len() / 2);
                self.ws.send(Message::binary(head.to_vec())).await.unwrap();
                self.ws.send(Message::binary(tail.to_vec())).await.unwrap();
            }
        }
    }

    async fn hello(&mut self, interval_ms: u64) {
        self.send(json!({ "op": 10, "d": { "heartbeat_interval": interval_ms } }))
            .await;
    }

    async fn dispatch(&mut self, sequence: u64, name: &str, data: Value) {
        self.send(json!({ "op": 0, "s": sequence, "t": name, "d": data }))
            .await;
    }

    async fn ready(&mut self, sequence: u64, session_id: &str, resume_url: &str) {
        self.dispatch(
            sequence,
            "READY",
            json!({
                "session_id": session_id,
                "resume_gateway_url": resume_url,
                "user": { "id": BOT_USER_ID, "username": "arrakis" }
            }),
        )
        .await;
    }

    async fn recv(&mut self) -> Value {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a frame from the shard");
            match message {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Close(frame))) => panic!("shard closed the connection: {frame:?}"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("read failed: {e}"),
                None => panic!("connection ended"),
            }
        }
    }

    /// Next frame with opcode `op`, skipping heartbeats and anything else
    async fn expect_op(&mut self, op: u64) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["op"] == op {
                return frame;
            }
        }
    }

    /// Close code the shard sends when it drops the connection
    async fn closed_by_shard(&mut self) -> Option<u16> {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for the shard to close");
            match message {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    async fn close_with(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: String::new().into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }
}

struct TestShard {
    shard: ShardConnection,
    bus: EventBus,
    lifecycle: broadcast::Receiver<ShardLifecycle>,
}

fn config(compress: bool) -> ShardConfig {
    let mut config = ShardConfig::new("bot-token", Intents::GUILDS | Intents::GUILD_MESSAGES);
    config.compress = compress;
    config
}

fn spawn_shard(
    gateway: &MockGateway,
    config: ShardConfig,
    respawn: Option<mpsc::UnboundedSender<RespawnRequest>>,
) -> TestShard {
    let bus = EventBus::new(64);
    let lifecycle = bus.subscribe_lifecycle();
    let (shard, _opened) = ShardConnection::spawn(ShardSpawn {
        id: 0,
        total: 1,
        gateway_url: gateway.url.clone(),
        config: Arc::new(config),
        bus: bus.clone(),
        fleet: FleetState::new(),
        generation: 7,
        respawn,
    })
    .unwrap();
    TestShard { shard, bus, lifecycle }
}

async fn wait_for(
    lifecycle: &mut broadcast::Receiver<ShardLifecycle>,
    matches: impl Fn(&LifecycleKind) -> bool,
) -> ShardLifecycle {
    timeout(WAIT, async {
        loop {
            let notice = lifecycle.recv().await.expect("lifecycle channel closed");
            if matches(&notice.kind) {
                return notice;
            }
        }
    })
    .await
    .expect("lifecycle notice never arrived")
}

#[tokio::test]
async fn resumable_close_resumes_the_session() {
    let mut gateway = MockGateway::start().await;
    let mut test = spawn_shard(&gateway, config(false), None);

    let mut first = gateway.accept().await;
    assert_eq!(first.uri, "/?v=10&encoding=json");
    first.hello(45_000).await;
    let identify = first.expect_op(2).await;
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(identify["d"]["token"], "bot-token");

    let resume_url = gateway.url.clone();
    first.ready(1, "session-a", &resume_url).await;
    first
        .dispatch(5, "MESSAGE_CREATE", json!({ "id": "1", "channel_id": "2" }))
        .await;
    wait_for(&mut test.lifecycle, |k| matches!(k, LifecycleKind::Ready { .. })).await;
    assert_eq!(test.shard.user_id(), Some(Id::new(80351110224678912)));
    first.close_with(4000).await;

    let notice = wait_for(&mut test.lifecycle, |k| {
        matches!(k, LifecycleKind::Disconnected { .. })
    })
    .await;
    assert_eq!(
        notice.kind,
        LifecycleKind::Disconnected {
            code: 4000,
            recovery: CloseRecovery::ResumeAndReconnect
        }
    );

    let mut second = gateway.accept().await;
    second.hello(45_000).await;
    let resume = second.expect_op(6).await;
    assert_eq!(
        resume["d"],
        json!({ "token": "bot-token", "session_id": "session-a", "seq": 5 })
    );

    second.dispatch(6, "RESUMED", json!({})).await;
    wait_for(&mut test.lifecycle, |k| *k == LifecycleKind::Resumed).await;
    assert_eq!(test.shard.status(), ShardStatus::Active);
    assert_eq!(test.shard.sequence(), Some(6));
    assert_eq!(test.shard.session_id().as_deref(), Some("session-a"));
    assert_eq!(test.shard.user_id(), Some(Id::new(80351110224678912)));

    test.shard.disconnect();
    assert_eq!(second.closed_by_shard().await, Some(1000));
}

#[tokio::test]
async fn session_timeout_close_identifies_again() {
    let mut gateway = MockGateway::start().await;
    let mut test = spawn_shard(&gateway, config(false), None);

    let mut first = gateway.accept().await;
    first.hello(45_000).await;
    first.expect_op(2).await;
    let resume_url = gateway.url.clone();
    first.ready(1, "session-a", &resume_url).await;
    wait_for(&mut test.lifecycle, |k| matches!(k, LifecycleKind::Ready { .. })).await;
    first.close_with(4009).await;

    let notice = wait_for(&mut test.lifecycle, |k| {
        matches!(k, LifecycleKind::Disconnected { .. })
    })
    .await;
    assert_eq!(
        notice.kind,
        LifecycleKind::Disconnected {
            code: 4009,
            recovery: CloseRecovery::ReconnectWithoutResume
        }
    );

    let mut second = gateway.accept().await;
    second.hello(45_000).await;
    let identify = second.expect_op(2).await;
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(test.shard.session_id(), None);

    test.shard.disconnect();
}

#[tokio::test]
async fn fatal_close_halts_the_shard() {
    let mut gateway = MockGateway::start().await;
    let mut test = spawn_shard(&gateway, config(false), None);

    let mut conn = gateway.accept().await;
    conn.hello(45_000).await;
    conn.expect_op(2).await;
    conn.close_with(4014).await;

    let notice = wait_for(&mut test.lifecycle, |k| matches!(k, LifecycleKind::Fatal { .. })).await;
    assert_eq!(notice.kind, LifecycleKind::Fatal { code: 4014 });
    assert!(matches!(
        test.shard.fatal_error(),
        Some(GatewayError::ShardFatal {
            shard_id: 0,
            code: 4014
        })
    ));
    assert_eq!(test.shard.status(), ShardStatus::Fatal);
    assert!(gateway.stays_quiet(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn compressed_transport_is_reassembled() {
    let mut gateway = MockGateway::start().await;
    let mut test = spawn_shard(&gateway, config(true), None);
    let mut messages = test.bus.subscribe("MESSAGE_CREATE");

    let mut conn = gateway.accept().await;
    assert!(conn.uri.contains("compress=zlib-stream"), "uri was {}", conn.uri);
    conn.deflate = Some(Compress::new(Compression::default(), true));

    conn.hello(45_000).await;
    let identify = conn.expect_op(2).await;
    assert_eq!(identify["d"]["compress"], false);

    let resume_url = gateway.url.clone();
    conn.ready(1, "session-z", &resume_url).await;
    conn.dispatch(2, "MESSAGE_CREATE", json!({ "id": "9", "content": "hello" }))
        .await;

    let event = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(event.shard_id, 0);
    assert_eq!(event.sequence, 2);
    assert_eq!(event.data["content"], "hello");
    wait_for(&mut test.lifecycle, |k| matches!(k, LifecycleKind::Ready { .. })).await;

    test.shard.disconnect();
}

#[tokio::test]
async fn heartbeat_ack_records_latency() {
    let mut gateway = MockGateway::start().await;
    let test = spawn_shard(&gateway, config(false), None);

    let mut conn = gateway.accept().await;
    conn.hello(100).await;
    conn.expect_op(2).await;
    let resume_url = gateway.url.clone();
    conn.ready(3, "session-h", &resume_url).await;

    let heartbeat = conn.expect_op(1).await;
    assert_eq!(heartbeat["d"], 3);
    conn.send(json!({ "op": 11 })).await;

    timeout(WAIT, async {
        while test.shard.latency().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("latency never recorded");

    // Server-requested heartbeat goes out immediately
    conn.send(json!({ "op": 1, "d": null })).await;
    conn.expect_op(1).await;

    test.shard.disconnect();
}

#[tokio::test]
async fn missed_heartbeat_ack_reconnects_and_resumes() {
    let mut gateway = MockGateway::start().await;
    let mut test = spawn_shard(&gateway, config(false), None);

    let mut first = gateway.accept().await;
    first.hello(100).await;
    first.expect_op(2).await;
    let resume_url = gateway.url.clone();
    first.ready(1, "session-z", &resume_url).await;

    // Never acknowledge: the second tick finds the first heartbeat unanswered
    assert_eq!(first.closed_by_shard().await, Some(4900));
    let notice = wait_for(&mut test.lifecycle, |k| {
        matches!(k, LifecycleKind::Disconnected { .. })
    })
    .await;
    assert_eq!(
        notice.kind,
        LifecycleKind::Disconnected {
            code: 4900,
            recovery: CloseRecovery::ResumeAndReconnect
        }
    );

    let mut second = gateway.accept().await;
    second.hello(45_000).await;
    let resume = second.expect_op(6).await;
    assert_eq!(resume["d"]["session_id"], "session-z");
    assert_eq!(resume["d"]["seq"], 1);

    test.shard.disconnect();
}

#[tokio::test]
async fn server_reconnect_request_resumes() {
    let mut gateway = MockGateway::start().await;
    let test = spawn_shard(&gateway, config(false), None);

    let mut first = gateway.accept().await;
    first.hello(45_000).await;
    first.expect_op(2).await;
    let resume_url = gateway.url.clone();
    first.ready(4, "session-r", &resume_url).await;
    first.send(json!({ "op": 7, "d": null })).await;
    assert_eq!(first.closed_by_shard().await, Some(4900));

    let mut second = gateway.accept().await;
    second.hello(45_000).await;
    let resume = second.expect_op(6).await;
    assert_eq!(resume["d"]["seq"], 4);

    test.shard.disconnect();
}

#[tokio::test]
async fn invalid_session_hands_shard_back_for_respawn() {
    let mut gateway = MockGateway::start().await;
    let (respawn_tx, mut respawn_rx) = mpsc::unbounded_channel();
    let test = spawn_shard(&gateway, config(false), Some(respawn_tx));

    let mut conn = gateway.accept().await;
    conn.hello(45_000).await;
    conn.expect_op(2).await;
    let resume_url = gateway.url.clone();
    conn.ready(1, "session-x", &resume_url).await;
    conn.send(json!({ "op": 9, "d": false })).await;

    let request = timeout(WAIT, respawn_rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        request,
        RespawnRequest {
            shard_id: 0,
            generation: 7
        }
    );
    assert_eq!(conn.closed_by_shard().await, Some(1000));
    assert_eq!(test.shard.session_id(), None);
    assert!(gateway.stays_quiet(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn orchestrator_paces_routes_and_respawns() {
    let api = MockServer::start().await;
    let mut gateway = MockGateway::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v10/gateway/bot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": gateway.url,
            "shards": 2,
            "session_start_limit": {
                "total": 1000, "remaining": 999, "reset_after": 0, "max_concurrency": 1
            }
        })))
        .expect(1)
        .mount(&api)
        .await;

    let mut rest_config = RestConfig::new("bot-token");
    rest_config.api_base = format!("{}/api", api.uri());
    let rest = RateLimitCoordinator::new(rest_config).unwrap();

    let mut shard_config = config(false);
    shard_config.identify_window = Duration::from_millis(300);
    let orchestrator = ShardOrchestrator::new(rest, shard_config);
    let mut lifecycle = orchestrator.events().subscribe_lifecycle();

    let connecting = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.connect(None).await }
    });

    let mut zero = gateway.accept().await;
    let mut one = gateway.accept().await;
    assert!(
        one.at - zero.at >= Duration::from_millis(250),
        "second identify slot came after {:?}",
        one.at - zero.at
    );
    connecting.await.unwrap().unwrap();
    assert_eq!(orchestrator.total_shards(), 2);
    assert_eq!(orchestrator.shard_ids(), vec![0, 1]);

    let resume_url = gateway.url.clone();
    for (expected, conn) in [(0, &mut zero), (1, &mut one)] {
        conn.hello(45_000).await;
        let identify = conn.expect_op(2).await;
        assert_eq!(identify["d"]["shard"], json!([expected, 2]));
        conn.ready(1, &format!("session-{expected}"), &resume_url).await;
    }
    wait_for(&mut lifecycle, |k| matches!(k, LifecycleKind::Ready { .. })).await;
    wait_for(&mut lifecycle, |k| matches!(k, LifecycleKind::Ready { .. })).await;
    assert_eq!(orchestrator.fleet().ready_shards(), 2);

    // (4194304 >> 22) % 2 == 1
    orchestrator
        .request_guild_members(
            Id::new(4194304),
            RequestGuildMembers {
                query: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap();
    let request = one.expect_op(8).await;
    assert_eq!(request["d"]["guild_id"], "4194304");

    orchestrator.update_presence(UpdatePresence::online()).unwrap();
    assert_eq!(zero.expect_op(3).await["d"]["status"], "online");
    assert_eq!(one.expect_op(3).await["d"]["status"], "online");

    // Discovery is cached; the mock expects exactly one call
    let info = orchestrator.gateway_info().await.unwrap();
    assert_eq!(info.shards, 2);

    zero.send(json!({ "op": 9, "d": false })).await;
    let mut replacement = gateway.accept().await;
    replacement.hello(45_000).await;
    let identify = replacement.expect_op(2).await;
    assert_eq!(identify["d"]["shard"], json!([0, 2]));

    timeout(WAIT, async {
        while orchestrator.shard(0).map(|s| s.generation()) != Some(3) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("shard 0 was never replaced");
    assert_eq!(orchestrator.shard(1).unwrap().generation(), 2);

    orchestrator.disconnect_all();
    assert!(orchestrator.shard_ids().is_empty());
    assert_eq!(one.closed_by_shard().await, Some(1000));
    assert_eq!(replacement.closed_by_shard().await, Some(1000));
}
