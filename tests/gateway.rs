#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt as _, StreamExt as _};
use gateway_client_sdk::error::Kind;
use gateway_client_sdk::gateway::etf;
use gateway_client_sdk::gateway::{
    CompressionFormat, Config, EncodingFormat, Gateway, GatewayEvent, GatewayState,
    ReconnectPolicy,
};
use gateway_client_sdk::intents::Intents;
use gateway_client_sdk::rest::StaticBootstrap;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use zstd::stream::write::Encoder as ZstdEncoder;

/// Long enough that the jittered first heartbeat rarely lands inside a test.
const HELLO_INTERVAL_MS: u64 = 600_000;

#[derive(Clone, Debug)]
enum ServerAction {
    Payload(Value),
    Close(u16, String),
}

#[derive(Clone, Copy, Default)]
struct ServerOptions {
    /// Speak the binary term format instead of JSON text frames
    etf: bool,
    /// Wrap every outbound payload in a shared compressed stream
    compress: Option<CompressionFormat>,
}

/// Per-connection outbound compression state.
enum ServerCompressor {
    Zlib(Compress),
    Zstd(ZstdEncoder<'static, Vec<u8>>),
}

/// Mock gateway server.
///
/// Every accepted connection immediately receives a hello and then follows
/// the broadcast action script. Client heartbeats are acknowledged
/// automatically and surfaced separately from other payloads.
struct MockGatewayServer {
    addr: SocketAddr,
    /// Actions pushed to ALL connected clients
    action_tx: broadcast::Sender<ServerAction>,
    /// Non-heartbeat payloads received from clients
    inbound_rx: mpsc::UnboundedReceiver<Value>,
    /// Heartbeat payloads received from clients
    beat_rx: mpsc::UnboundedReceiver<Value>,
    /// Request path of each accepted connection
    path_rx: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicU32>,
}

impl MockGatewayServer {
    async fn start(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (action_tx, _) = broadcast::channel::<ServerAction>(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Value>();
        let (beat_tx, beat_rx) = mpsc::unbounded_channel::<Value>();
        let (path_tx, path_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicU32::new(0));

        let accept_actions = action_tx.clone();
        let accept_connections = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);

                let inbound_tx = inbound_tx.clone();
                let beat_tx = beat_tx.clone();
                let path_tx = path_tx.clone();
                let actions = accept_actions.subscribe();
                tokio::spawn(serve_client(
                    stream, options, inbound_tx, beat_tx, path_tx, actions,
                ));
            }
        });

        Self {
            addr,
            action_tx,
            inbound_rx,
            beat_rx,
            path_rx,
            connections,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Send a payload to all connected clients.
    fn send(&self, payload: Value) {
        drop(self.action_tx.send(ServerAction::Payload(payload)));
    }

    /// Close all connected clients with the given code.
    fn close(&self, code: u16, reason: &str) {
        drop(self.action_tx.send(ServerAction::Close(code, reason.to_owned())));
    }

    /// Next non-heartbeat payload from any client.
    async fn recv_payload(&mut self) -> Option<Value> {
        self.recv_payload_within(Duration::from_secs(2)).await
    }

    async fn recv_payload_within(&mut self, wait: Duration) -> Option<Value> {
        timeout(wait, self.inbound_rx.recv()).await.ok().flatten()
    }

    /// Next heartbeat payload from any client.
    async fn recv_beat(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(2), self.beat_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Request path of the next accepted connection.
    async fn recv_path(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.path_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn serve_client(
    stream: TcpStream,
    options: ServerOptions,
    inbound_tx: mpsc::UnboundedSender<Value>,
    beat_tx: mpsc::UnboundedSender<Value>,
    path_tx: mpsc::UnboundedSender<String>,
    mut actions: broadcast::Receiver<ServerAction>,
) {
    let mut path = String::new();
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().to_string();
        Ok(resp)
    })
    .await
    else {
        return;
    };
    drop(path_tx.send(path));

    let mut compressor = options.compress.map(|format| match format {
        CompressionFormat::ZlibStream => {
            ServerCompressor::Zlib(Compress::new(Compression::default(), true))
        }
        CompressionFormat::ZstdStream => {
            ServerCompressor::Zstd(ZstdEncoder::new(Vec::new(), 0).unwrap())
        }
    });
    let (mut write, mut read) = ws.split();

    let hello = json!({"op": 10, "d": {"heartbeat_interval": HELLO_INTERVAL_MS}});
    if write
        .send(to_frame(options, compressor.as_mut(), &hello))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Some(value) = from_frame(msg) {
                            if value["op"] == 1 {
                                let ack = json!({"op": 11, "d": null});
                                if write.send(to_frame(options, compressor.as_mut(), &ack)).await.is_err() {
                                    break;
                                }
                                drop(beat_tx.send(value));
                            } else {
                                drop(inbound_tx.send(value));
                            }
                        }
                    }
                    _ => break,
                }
            }
            action = actions.recv() => {
                match action {
                    Ok(ServerAction::Payload(value)) => {
                        if write.send(to_frame(options, compressor.as_mut(), &value)).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServerAction::Close(code, reason)) => {
                        drop(write.send(Message::Close(Some(CloseFrame {
                            code: code.into(),
                            reason: reason.into(),
                        }))).await);
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

fn to_frame(
    options: ServerOptions,
    compressor: Option<&mut ServerCompressor>,
    value: &Value,
) -> Message {
    let bytes = if options.etf {
        etf::encode(value)
    } else {
        value.to_string().into_bytes()
    };
    match compressor {
        Some(ServerCompressor::Zlib(z)) => {
            let mut out = Vec::with_capacity(bytes.len() + 64);
            z.compress_vec(&bytes, &mut out, FlushCompress::Sync).unwrap();
            Message::Binary(out.into())
        }
        Some(ServerCompressor::Zstd(encoder)) => {
            encoder.write_all(&bytes).unwrap();
            encoder.flush().unwrap();
            Message::Binary(std::mem::take(encoder.get_mut()).into())
        }
        None if options.etf => Message::Binary(bytes.into()),
        None => Message::Text(String::from_utf8(bytes).unwrap().into()),
    }
}

/// Client frames are never compressed.
fn from_frame(msg: Message) -> Option<Value> {
    match msg {
        Message::Text(text) => serde_json::from_str(&text).ok(),
        Message::Binary(bytes) => etf::decode(&bytes).ok(),
        _ => None,
    }
}

fn test_config() -> Config {
    let mut config = Config::new(SecretString::from("test-token"), Intents::GUILDS);
    config.open_timeout = Duration::from_secs(2);
    config.ready_timeout = Duration::from_secs(8);
    config.reconnect = ReconnectPolicy::new(vec![Duration::from_millis(50)]);
    config
}

fn ready(session_id: &str, resume_url: &str) -> Value {
    json!({
        "op": 0,
        "s": 1,
        "t": "READY",
        "d": {"v": 10, "session_id": session_id, "resume_gateway_url": resume_url}
    })
}

fn dispatch(event: &str, s: u64, d: Value) -> Value {
    json!({"op": 0, "s": s, "t": event, "d": d})
}

async fn wait_for<F>(
    events: &mut broadcast::Receiver<GatewayEvent>,
    secs: u64,
    mut pred: F,
) -> GatewayEvent
where
    F: FnMut(&GatewayEvent) -> bool,
{
    timeout(Duration::from_secs(secs), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed in time")
}

/// Drive the identify handshake for one connection and return the identify
/// payload the client sent.
async fn complete_handshake(server: &mut MockGatewayServer, gateway: &Gateway, session_id: &str) -> Value {
    let resume_url = server.ws_url();
    let (connected, identify) = tokio::join!(gateway.connect(), async {
        let identify = server.recv_payload().await.expect("identify");
        assert_eq!(identify["op"], 2);
        server.send(ready(session_id, &resume_url));
        identify
    });
    connected.expect("connect");
    identify
}

mod handshake {
    use super::*;

    #[tokio::test]
    async fn connect_identifies_and_becomes_ready() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        let identify = complete_handshake(&mut server, &gateway, "session-1").await;

        assert_eq!(identify["d"]["token"], "test-token");
        assert_eq!(identify["d"]["intents"], Intents::GUILDS.bits());
        assert!(identify["d"]["properties"]["os"].is_string());
        assert_eq!(gateway.state(), GatewayState::Ready);

        let event = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::SessionStarted { .. })
        })
        .await;
        let GatewayEvent::SessionStarted { session_id, shard_id } = event else {
            unreachable!();
        };
        assert_eq!(session_id, "session-1");
        assert_eq!(shard_id, 0);

        let path = server.recv_path().await.expect("request path");
        assert!(path.contains("v=10"), "missing protocol version: {path}");
        assert!(path.contains("encoding=json"), "missing encoding: {path}");
        assert!(!path.contains("compress"), "unexpected compress: {path}");
    }

    #[tokio::test]
    async fn shard_override_is_sent_in_identify() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let mut config = test_config();
        config.shard_count = Some(2);
        let gateway = Gateway::new(config, bootstrap);

        let identify = complete_handshake(&mut server, &gateway, "session-1").await;
        assert_eq!(identify["d"]["shard"], json!([0, 2]));
    }

    #[tokio::test]
    async fn ready_timeout_fails_connect() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let mut config = test_config();
        config.ready_timeout = Duration::from_millis(300);
        let gateway = Gateway::new(config, bootstrap);

        // The server swallows the identify and never answers.
        let error = gateway.connect().await.expect_err("ready timeout");
        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(server.recv_payload().await.is_some(), "identify was sent");

        gateway.destroy();
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_without_reconnect() {
        let mut config = test_config();
        config.auto_reconnect = false;
        // Nothing listens on a reserved port.
        let bootstrap = Arc::new(StaticBootstrap::single("ws://127.0.0.1:1"));
        let gateway = Gateway::new(config, bootstrap);

        let error = gateway.connect().await.expect_err("refused");
        assert_eq!(error.kind(), Kind::WebSocket);
        assert_eq!(gateway.state(), GatewayState::Disconnected);
    }
}

mod dispatch_flow {
    use super::*;

    #[tokio::test]
    async fn dispatches_are_forwarded_in_order() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;

        server.send(dispatch("MESSAGE_CREATE", 2, json!({"content": "first"})));
        server.send(dispatch("MESSAGE_CREATE", 3, json!({"content": "second"})));

        let first = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { event, .. } if event == "MESSAGE_CREATE")
        })
        .await;
        let GatewayEvent::Dispatch { payload, .. } = first else {
            unreachable!();
        };
        assert_eq!(payload["content"], "first");

        let second = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { event, .. } if event == "MESSAGE_CREATE")
        })
        .await;
        let GatewayEvent::Dispatch { payload, .. } = second else {
            unreachable!();
        };
        assert_eq!(payload["content"], "second");
    }

    #[tokio::test]
    async fn server_heartbeat_request_is_answered_with_last_sequence() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;
        server.send(dispatch("MESSAGE_CREATE", 5, json!({})));
        wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { .. })
        })
        .await;

        server.send(json!({"op": 1, "d": null}));

        let beat = server.recv_beat().await.expect("immediate heartbeat");
        assert_eq!(beat["op"], 1);
        assert_eq!(beat["d"], 5);
    }

    #[tokio::test]
    async fn caller_sends_are_delivered_and_disconnected_sends_are_dropped() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);

        // Not connected yet: a warning no-op, not an error.
        gateway
            .update_presence(json!({"status": "online"}))
            .expect("send while disconnected is a no-op");

        complete_handshake(&mut server, &gateway, "session-1").await;

        gateway
            .request_guild_members(4_194_304, "", 0)
            .expect("send while ready");
        let sent = server.recv_payload().await.expect("guild member request");
        assert_eq!(sent["op"], 8);
        assert_eq!(sent["d"]["guild_id"], "4194304");
    }
}

mod reconnect {
    use super::*;

    #[tokio::test]
    async fn server_reconnect_request_cycles_and_resumes() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;
        server.send(dispatch("MESSAGE_CREATE", 3, json!({})));
        wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { .. })
        })
        .await;

        server.send(json!({"op": 7, "d": null}));

        // Second connection resumes with the stored session and sequence.
        let resume = server.recv_payload().await.expect("resume");
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["session_id"], "session-1");
        assert_eq!(resume["d"]["seq"], 3);

        server.send(json!({"op": 0, "t": "RESUMED", "s": 4, "d": null}));
        let event = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::SessionResumed { .. })
        })
        .await;
        let GatewayEvent::SessionResumed { session_id } = event else {
            unreachable!();
        };
        assert_eq!(session_id, "session-1");
        assert_eq!(server.connections(), 2);
        assert_eq!(gateway.state(), GatewayState::Ready);
    }

    #[tokio::test]
    async fn resumable_close_schedules_backoff_then_resumes() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;
        server.send(dispatch("MESSAGE_CREATE", 9, json!({})));
        wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { .. })
        })
        .await;

        server.close(4000, "unknown error");

        let scheduled = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::ReconnectScheduled { .. })
        })
        .await;
        let GatewayEvent::ReconnectScheduled { attempt, delay } = scheduled else {
            unreachable!();
        };
        assert_eq!(attempt, 1);
        assert_eq!(delay, Duration::from_millis(50));

        let resume = server.recv_payload().await.expect("resume");
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["seq"], 9);
    }

    #[tokio::test]
    async fn fatal_close_code_terminates_without_retry() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;
        server.close(4004, "Authentication failed");

        let event = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Terminated { .. })
        })
        .await;
        let GatewayEvent::Terminated { code } = event else {
            unreachable!();
        };
        assert_eq!(code, Some(4004));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.connections(), 1, "no reconnect after a fatal close");
        assert_eq!(gateway.state(), GatewayState::Disconnected);
    }

    #[tokio::test]
    async fn clean_close_discards_session_so_next_connect_identifies() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;
        server.send(dispatch("MESSAGE_CREATE", 6, json!({})));
        wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { .. })
        })
        .await;

        server.close(1000, "bye");
        let event = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Terminated { .. })
        })
        .await;
        let GatewayEvent::Terminated { code } = event else {
            unreachable!();
        };
        assert_eq!(code, Some(1000));

        // A fresh connect must identify, not resume.
        let identify = complete_handshake(&mut server, &gateway, "session-2").await;
        assert_eq!(identify["op"], 2);
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn destroy_is_terminal() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut states = gateway.state_changes();

        complete_handshake(&mut server, &gateway, "session-1").await;

        gateway.destroy();
        timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != GatewayState::Destroyed {
                states.changed().await.unwrap();
            }
        })
        .await
        .expect("destroyed state");

        let error = gateway.connect().await.expect_err("connect after destroy");
        assert_eq!(error.kind(), Kind::Validation);
    }
}

mod invalid_session {
    use super::*;

    #[tokio::test]
    async fn resumable_invalid_session_cycles_to_resume() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;
        server.send(dispatch("MESSAGE_CREATE", 2, json!({})));
        wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { .. })
        })
        .await;

        server.send(json!({"op": 9, "d": true}));

        let resume = server.recv_payload().await.expect("resume");
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["session_id"], "session-1");
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn non_resumable_invalid_session_reidentifies_on_the_same_socket() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;

        server.send(json!({"op": 9, "d": false}));

        // The protocol mandates a 1-5 second randomized wait first.
        let identify = server
            .recv_payload_within(Duration::from_secs(7))
            .await
            .expect("fresh identify");
        assert_eq!(identify["op"], 2);
        assert_eq!(server.connections(), 1, "same socket, no reconnect");

        server.send(ready("session-2", &server.ws_url()));
        let event = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::SessionStarted { .. })
        })
        .await;
        let GatewayEvent::SessionStarted { session_id, .. } = event else {
            unreachable!();
        };
        assert_eq!(session_id, "session-2");
    }

    #[tokio::test]
    async fn destroy_interrupts_the_reidentify_wait() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut states = gateway.state_changes();

        complete_handshake(&mut server, &gateway, "session-1").await;

        server.send(json!({"op": 9, "d": false}));

        // The driver is now holding the 1-5 second randomized wait before
        // the fresh identify.
        timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != GatewayState::Identifying {
                states.changed().await.unwrap();
            }
        })
        .await
        .expect("identifying state");

        let asked = Instant::now();
        gateway.destroy();
        timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != GatewayState::Destroyed {
                states.changed().await.unwrap();
            }
        })
        .await
        .expect("destroyed state");
        assert!(
            asked.elapsed() < Duration::from_millis(500),
            "destroy must not wait out the identify delay"
        );
    }
}

mod wire_formats {
    use super::*;

    #[tokio::test]
    async fn etf_connection_completes_handshake_and_forwards_dispatches() {
        let mut server = MockGatewayServer::start(ServerOptions {
            etf: true,
            compress: None,
        })
        .await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let mut config = test_config();
        config.encoding = EncodingFormat::Etf;
        let gateway = Gateway::new(config, bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;

        let path = server.recv_path().await.expect("request path");
        assert!(path.contains("encoding=etf"), "missing encoding: {path}");

        server.send(dispatch("MESSAGE_CREATE", 2, json!({"content": "binary"})));
        let event = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Dispatch { .. })
        })
        .await;
        let GatewayEvent::Dispatch { payload, .. } = event else {
            unreachable!();
        };
        assert_eq!(payload["content"], "binary");
    }

    #[tokio::test]
    async fn compressed_stream_spans_the_whole_connection() {
        let mut server = MockGatewayServer::start(ServerOptions {
            etf: false,
            compress: Some(CompressionFormat::ZlibStream),
        })
        .await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let mut config = test_config();
        config.compress = Some(CompressionFormat::ZlibStream);
        let gateway = Gateway::new(config, bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;

        let path = server.recv_path().await.expect("request path");
        assert!(
            path.contains("compress=zlib-stream"),
            "missing compress negotiation: {path}"
        );

        // Several messages over one shared dictionary.
        for s in 2..5_u64 {
            server.send(dispatch("MESSAGE_CREATE", s, json!({"content": "again and again"})));
        }
        for _ in 2..5 {
            wait_for(&mut events, 2, |e| {
                matches!(e, GatewayEvent::Dispatch { .. })
            })
            .await;
        }
    }

    #[tokio::test]
    async fn zstd_stream_negotiates_and_decompresses_dispatches() {
        let mut server = MockGatewayServer::start(ServerOptions {
            etf: false,
            compress: Some(CompressionFormat::ZstdStream),
        })
        .await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let mut config = test_config();
        config.compress = Some(CompressionFormat::ZstdStream);
        let gateway = Gateway::new(config, bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;

        let path = server.recv_path().await.expect("request path");
        assert!(
            path.contains("compress=zstd-stream"),
            "missing compress negotiation: {path}"
        );

        for s in 2..5_u64 {
            server.send(dispatch("MESSAGE_CREATE", s, json!({"content": "zstd payload"})));
        }
        for _ in 2..5 {
            let event = wait_for(&mut events, 2, |e| {
                matches!(e, GatewayEvent::Dispatch { .. })
            })
            .await;
            let GatewayEvent::Dispatch { payload, .. } = event else {
                unreachable!();
            };
            assert_eq!(payload["content"], "zstd payload");
        }
    }
}

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn caller_disconnect_with_clean_code_terminates() {
        let mut server = MockGatewayServer::start(ServerOptions::default()).await;
        let bootstrap = Arc::new(StaticBootstrap::single(server.ws_url()));
        let gateway = Gateway::new(test_config(), bootstrap);
        let mut events = gateway.subscribe();

        complete_handshake(&mut server, &gateway, "session-1").await;

        gateway.disconnect(1000, "done").expect("disconnect");
        let event = wait_for(&mut events, 2, |e| {
            matches!(e, GatewayEvent::Terminated { .. })
        })
        .await;
        let GatewayEvent::Terminated { code } = event else {
            unreachable!();
        };
        assert_eq!(code, Some(1000));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.connections(), 1, "no reconnect after disconnect");
    }
}
