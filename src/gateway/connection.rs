//! Gateway handle and driver task.
//!
//! [`Gateway`] is a cheap clonable handle over channels; all socket and
//! protocol state lives in a spawned driver task. The driver owns the
//! session, the heartbeat state machine, the shared compressed stream and
//! the encoder, and runs a single select loop per connection. One gateway
//! drives exactly one shard's socket; multi-shard processes create one
//! gateway per shard over a shared [`ShardManager`].

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use rand::Rng as _;
use secrecy::ExposeSecret as _;
use serde_json::{json, Value};
use strum_macros::Display;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::Error;
use crate::gateway::compression::CompressionService;
use crate::gateway::config::{Config, PROTOCOL_VERSION};
use crate::gateway::encoding::{EncodedFrame, EncodingService};
use crate::gateway::error::GatewayError;
use crate::gateway::event::GatewayEvent;
use crate::gateway::heartbeat::{Beat, HeartbeatManager};
use crate::gateway::payload::{self, close, Opcode, PayloadEnvelope};
use crate::gateway::session::{ConnectionAttempt, Session};
use crate::gateway::shard::{ShardManager, ShardStatus};
use crate::rest::Bootstrap;

const EVENT_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type ConnectSignal = oneshot::Sender<crate::Result<()>>;

/// Connection lifecycle, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum GatewayState {
    Disconnected,
    Connecting,
    /// Socket open, waiting for the server's hello
    AwaitingHello,
    Identifying,
    Resuming,
    Ready,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
    Destroyed,
}

impl GatewayState {
    /// Whether a socket currently exists for this connection.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(
            self,
            Self::AwaitingHello | Self::Identifying | Self::Resuming | Self::Ready
        )
    }

    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

enum Command {
    Connect { done: ConnectSignal },
    Send { op: Opcode, data: Value },
    Disconnect { code: u16, reason: String },
    Destroy,
}

/// Handle to one gateway connection.
///
/// Cloning is cheap and every clone talks to the same driver task. Dropping
/// all clones stops the driver.
#[derive(Debug, Clone)]
pub struct Gateway {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<GatewayState>,
    event_tx: broadcast::Sender<GatewayEvent>,
    latency_rx: watch::Receiver<Option<Duration>>,
    ready_timeout: Duration,
}

impl Gateway {
    /// Spawn the driver task for a single-connection gateway. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn new(config: Config, bootstrap: Arc<dyn Bootstrap>) -> Self {
        Self::build(config, bootstrap, None)
    }

    /// Spawn a gateway that paces its identify through a shared
    /// [`ShardManager`]. Each shard of a multi-shard process gets its own
    /// gateway, all sharing one manager.
    #[must_use]
    pub fn with_shards(
        config: Config,
        bootstrap: Arc<dyn Bootstrap>,
        shards: Arc<Mutex<ShardManager>>,
    ) -> Self {
        Self::build(config, bootstrap, Some(shards))
    }

    fn build(
        config: Config,
        bootstrap: Arc<dyn Bootstrap>,
        shards: Option<Arc<Mutex<ShardManager>>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(GatewayState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (latency_tx, latency_rx) = watch::channel(None);

        let ready_timeout = config.ready_timeout;
        let encoding = EncodingService::new(config.encoding);

        let driver = Driver {
            bootstrap,
            shards,
            session: Session::default(),
            attempt: ConnectionAttempt::new(),
            encoding,
            compression: None,
            heartbeat: HeartbeatManager::new(),
            state_tx,
            event_tx: event_tx.clone(),
            latency_tx,
            cached_url: None,
            resume_next: true,
            destroyed: false,
            config,
        };
        tokio::spawn(driver.run(cmd_rx));

        Self {
            cmd_tx,
            state_rx,
            event_tx,
            latency_rx,
            ready_timeout,
        }
    }

    /// Open a connection and wait for session establishment.
    ///
    /// Any existing socket is closed first. Resolves once the session is
    /// live (fresh or resumed); fails after the configured ready timeout,
    /// though the driver keeps retrying in the background when automatic
    /// reconnects are enabled.
    pub async fn connect(&self) -> crate::Result<()> {
        let (done, ready) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { done })
            .map_err(|_| Error::from(GatewayError::Destroyed))?;

        match timeout(self.ready_timeout, ready).await {
            Err(_) => Err(GatewayError::HandshakeTimeout {
                phase: "session establishment",
                waited: self.ready_timeout,
            }
            .into()),
            Ok(Err(_)) => Err(GatewayError::Destroyed.into()),
            Ok(Ok(result)) => result,
        }
    }

    /// Queue an arbitrary payload for the wire.
    ///
    /// A warning no-op when no socket is open; sends never buffer across
    /// connections.
    pub fn send(&self, op: Opcode, data: Value) -> crate::Result<()> {
        let state = self.state();
        if state == GatewayState::Destroyed {
            return Err(GatewayError::Destroyed.into());
        }
        if !state.is_open() {
            tracing::warn!(?op, %state, "dropping send: gateway socket is not open");
            return Ok(());
        }
        self.cmd_tx
            .send(Command::Send { op, data })
            .map_err(|_| GatewayError::Destroyed.into())
    }

    /// Forward a presence update verbatim.
    pub fn update_presence(&self, presence: Value) -> crate::Result<()> {
        self.send(Opcode::PresenceUpdate, presence)
    }

    /// Ask the server to stream the member list of a guild.
    pub fn request_guild_members(
        &self,
        guild_id: u64,
        query: &str,
        limit: u32,
    ) -> crate::Result<()> {
        self.send(
            Opcode::RequestGuildMembers,
            payload::request_guild_members(guild_id, query, limit),
        )
    }

    /// Gracefully close the connection with the given close code.
    ///
    /// A clean code discards session state; any other code keeps it so a
    /// later [`Gateway::connect`] can resume. No automatic reconnect is
    /// scheduled either way.
    pub fn disconnect(&self, code: u16, reason: impl Into<String>) -> crate::Result<()> {
        self.cmd_tx
            .send(Command::Disconnect {
                code,
                reason: reason.into(),
            })
            .map_err(|_| GatewayError::Destroyed.into())
    }

    /// Tear the gateway down for good. Irreversible; subsequent calls on
    /// any clone fail with a destroyed error.
    pub fn destroy(&self) {
        _ = self.cmd_tx.send(Command::Destroy);
    }

    #[must_use]
    pub fn state(&self) -> GatewayState {
        *self.state_rx.borrow()
    }

    /// Watch the connection lifecycle.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<GatewayState> {
        self.state_rx.clone()
    }

    /// Subscribe to lifecycle and dispatch events. Each receiver sees
    /// events in frame arrival order; slow receivers lag and lose the
    /// oldest events rather than blocking the driver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    /// Round-trip time of the most recent acknowledged heartbeat.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        *self.latency_rx.borrow()
    }
}

/// How one connection ended, as seen by the reconnect loop.
enum Outcome {
    /// Deliberate shutdown; session discarded, no reconnect.
    Clean { code: Option<u16> },
    /// Caller disconnect with a non-clean code; session kept for a later
    /// resume, no automatic reconnect.
    Stopped { code: u16 },
    /// Server rejected the connection; surface and stop.
    Fatal { code: u16, reason: String },
    /// Recoverable failure; retry per the backoff schedule.
    Retry { error: Error },
    /// Caller asked for a fresh connection; retry immediately without
    /// counting a failure.
    Restart,
    Destroyed,
}

/// Timers owned by one socket's serve loop. A disarmed timer never fires.
#[derive(Default)]
struct Timers {
    /// Next scheduled heartbeat
    beat: Option<Pin<Box<Sleep>>>,
    /// Deferred identify, armed while the randomized invalid-session wait
    /// or the shard's identify bucket delay runs down
    identify: Option<Pin<Box<Sleep>>>,
}

struct Driver {
    config: Config,
    bootstrap: Arc<dyn Bootstrap>,
    shards: Option<Arc<Mutex<ShardManager>>>,
    session: Session,
    attempt: ConnectionAttempt,
    encoding: EncodingService,
    /// Rebuilt per connection when a compressed stream is negotiated
    compression: Option<CompressionService>,
    heartbeat: HeartbeatManager,
    state_tx: watch::Sender<GatewayState>,
    event_tx: broadcast::Sender<GatewayEvent>,
    latency_tx: watch::Sender<Option<Duration>>,
    /// Wire URL from bootstrap, reused across reconnects
    cached_url: Option<String>,
    /// Prefer resuming on the next connection when the session allows it
    resume_next: bool,
    destroyed: bool,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while !self.destroyed {
            let Some(cmd) = cmd_rx.recv().await else { break };
            match cmd {
                Command::Connect { done } => {
                    let mut pending = Some(done);
                    self.attempt.begin();
                    self.connect_loop(&mut cmd_rx, &mut pending).await;
                }
                Command::Destroy => {
                    self.destroyed = true;
                }
                Command::Send { op, .. } => {
                    tracing::warn!(?op, "dropping send: gateway is not connected");
                }
                // Already disconnected.
                Command::Disconnect { .. } => {}
            }
        }

        self.set_state(GatewayState::Destroyed);
        _ = self.event_tx.send(GatewayEvent::Terminated { code: None });
        tracing::debug!("gateway driver stopped");
    }

    /// Connect, serve until the socket ends, and keep reconnecting per the
    /// backoff schedule until a terminal outcome.
    async fn connect_loop(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Option<ConnectSignal>,
    ) {
        loop {
            if self.destroyed {
                fail_pending(pending, GatewayError::Destroyed.into());
                return;
            }

            let attempt = self.attempt.attempts + 1;
            _ = self.event_tx.send(GatewayEvent::Connecting { attempt });
            self.set_state(GatewayState::Connecting);
            self.set_shard_status(ShardStatus::Connecting);

            match self.establish_and_serve(cmd_rx, pending).await {
                Outcome::Clean { code } => {
                    tracing::info!(?code, "gateway closed cleanly");
                    self.session.clear();
                    self.resume_next = false;
                    self.set_shard_status(ShardStatus::Disconnected);
                    self.set_state(GatewayState::Disconnected);
                    _ = self.event_tx.send(GatewayEvent::Terminated { code });
                    fail_pending(
                        pending,
                        GatewayError::Closed {
                            code: code.unwrap_or(close::NORMAL),
                            reason: "closed before session establishment".to_owned(),
                        }
                        .into(),
                    );
                    return;
                }
                Outcome::Stopped { code } => {
                    tracing::info!(code, "gateway disconnected; session kept for resume");
                    self.resume_next = true;
                    self.set_shard_status(ShardStatus::Disconnected);
                    self.set_state(GatewayState::Disconnected);
                    _ = self.event_tx.send(GatewayEvent::Terminated { code: Some(code) });
                    fail_pending(
                        pending,
                        GatewayError::Closed {
                            code,
                            reason: "disconnected before session establishment".to_owned(),
                        }
                        .into(),
                    );
                    return;
                }
                Outcome::Fatal { code, reason } => {
                    tracing::error!(code, %reason, "gateway rejected the connection; not retrying");
                    self.session.clear();
                    self.resume_next = false;
                    self.set_shard_status(ShardStatus::Disconnected);
                    self.set_state(GatewayState::Disconnected);
                    _ = self.event_tx.send(GatewayEvent::Terminated { code: Some(code) });
                    fail_pending(pending, GatewayError::Fatal { code, reason }.into());
                    return;
                }
                Outcome::Destroyed => {
                    fail_pending(pending, GatewayError::Destroyed.into());
                    return;
                }
                Outcome::Restart => {}
                Outcome::Retry { error } => {
                    let attempt = self.attempt.record_failure();
                    tracing::warn!(attempt, error = %error, "gateway connection lost");
                    _ = self.event_tx.send(GatewayEvent::ConnectionFailed { attempt });
                    self.reset_shard();

                    if !self.config.auto_reconnect {
                        self.set_state(GatewayState::Disconnected);
                        fail_pending(pending, error);
                        return;
                    }

                    let delay = self.config.reconnect.delay(attempt);
                    self.set_state(GatewayState::Reconnecting);
                    _ = self
                        .event_tx
                        .send(GatewayEvent::ReconnectScheduled { attempt, delay });
                    tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                    if !self.backoff(cmd_rx, delay, pending).await {
                        return;
                    }
                }
            }
        }
    }

    /// Wait out a reconnect delay while staying responsive to commands.
    /// Returns `false` when the loop must stop instead of retrying.
    async fn backoff(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        delay: Duration,
        pending: &mut Option<ConnectSignal>,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = sleep_until(deadline) => return true,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Destroy) => {
                        self.destroyed = true;
                        fail_pending(pending, GatewayError::Destroyed.into());
                        return false;
                    }
                    Some(Command::Disconnect { code, .. }) => {
                        self.set_state(GatewayState::Disconnected);
                        _ = self.event_tx.send(GatewayEvent::Terminated { code: Some(code) });
                        fail_pending(
                            pending,
                            GatewayError::Closed {
                                code,
                                reason: "disconnected while waiting to reconnect".to_owned(),
                            }
                            .into(),
                        );
                        return false;
                    }
                    Some(Command::Connect { done }) => {
                        // Skip the rest of the wait.
                        if pending.is_none() {
                            *pending = Some(done);
                        } else {
                            _ = done.send(Err(Error::validation("connect already in progress")));
                        }
                        return true;
                    }
                    Some(Command::Send { op, .. }) => {
                        tracing::warn!(?op, "dropping send: gateway is reconnecting");
                    }
                },
            }
        }
    }

    async fn establish_and_serve(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Option<ConnectSignal>,
    ) -> Outcome {
        let resume = self.resume_next && self.session.can_resume();
        let url = match self.wire_url(resume).await {
            Ok(url) => url,
            Err(error) => return Outcome::Retry { error },
        };

        tracing::debug!(resume, "opening gateway socket");
        let socket = match timeout(self.config.open_timeout, connect_async(url.as_str())).await {
            Err(_) => {
                return Outcome::Retry {
                    error: GatewayError::HandshakeTimeout {
                        phase: "socket open",
                        waited: self.config.open_timeout,
                    }
                    .into(),
                };
            }
            Ok(Err(e)) => return Outcome::Retry { error: e.into() },
            Ok(Ok((socket, _response))) => socket,
        };

        _ = self.event_tx.send(GatewayEvent::Connected);
        self.set_state(GatewayState::AwaitingHello);
        // Per-connection state never survives the socket.
        self.compression = match self.config.compress.map(CompressionService::new).transpose() {
            Ok(service) => service,
            Err(e) => return Outcome::Retry { error: e.into() },
        };
        self.heartbeat.reset();
        _ = self.latency_tx.send(None);

        self.serve(socket, resume, cmd_rx, pending).await
    }

    /// Wire URL with protocol version, encoding and compression negotiated
    /// as query parameters. Resume attempts go to the session's resume URL.
    async fn wire_url(&mut self, resume: bool) -> crate::Result<String> {
        let base = match self.session.resume_url.clone() {
            Some(url) if resume => url,
            _ => self.gateway_url().await?,
        };

        let mut url = Url::parse(&base)?;
        url.query_pairs_mut()
            .append_pair("v", &PROTOCOL_VERSION.to_string())
            .append_pair("encoding", &self.encoding.format().to_string());
        if let Some(format) = self.config.compress {
            url.query_pairs_mut()
                .append_pair("compress", &format.to_string());
        }
        Ok(url.into())
    }

    /// Bootstrap URL, fetched once and cached; also provisions the shard
    /// manager when sharding is in play and none was supplied.
    async fn gateway_url(&mut self) -> crate::Result<String> {
        if let Some(url) = &self.cached_url {
            return Ok(url.clone());
        }

        let info = self.bootstrap.fetch().await?;
        let sharding = self.config.shard_count.is_some() || info.shards > 1;
        if sharding && self.shards.is_none() {
            self.shards = Some(Arc::new(Mutex::new(ShardManager::spawn(
                info.guild_count,
                info.session_start_limit.max_concurrency,
                info.shards,
                self.config.shard_count,
            ))));
        }
        self.cached_url = Some(info.url.clone());
        Ok(info.url)
    }

    /// Single select loop for one open socket: inbound frames, heartbeat
    /// timers, and caller commands.
    async fn serve(
        &mut self,
        socket: WsStream,
        resume: bool,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        pending: &mut Option<ConnectSignal>,
    ) -> Outcome {
        let (mut write, mut read) = socket.split();
        let mut timers = Timers::default();

        loop {
            tokio::select! {
                frame = read.next() => {
                    let Some(frame) = frame else {
                        self.resume_next = true;
                        return Outcome::Retry {
                            error: GatewayError::Closed {
                                code: close::ABNORMAL,
                                reason: "connection reset without a close frame".to_owned(),
                            }
                            .into(),
                        };
                    };
                    let message = match frame {
                        Ok(message) => message,
                        Err(e) => {
                            self.resume_next = true;
                            return Outcome::Retry { error: e.into() };
                        }
                    };
                    if let Some(outcome) = self
                        .handle_message(message, resume, &mut write, &mut timers, pending)
                        .await
                    {
                        return outcome;
                    }
                }
                () = timer_due(&mut timers.beat) => {
                    match self.heartbeat.tick() {
                        Beat::Zombie => {
                            tracing::warn!("heartbeat never acknowledged; cycling the connection");
                            self.resume_next = true;
                            return Outcome::Retry { error: GatewayError::Zombie.into() };
                        }
                        Beat::Send => {
                            if let Err(e) = self.send_heartbeat(&mut write).await {
                                self.resume_next = true;
                                return Outcome::Retry { error: e.into() };
                            }
                            self.heartbeat.sent();
                        }
                    }
                    timers.beat = self.heartbeat.interval().map(|i| Box::pin(sleep(i)));
                }
                () = timer_due(&mut timers.identify) => {
                    timers.identify = None;
                    if let Err(e) = self.send_identify(&mut write).await {
                        self.resume_next = true;
                        return Outcome::Retry { error: e.into() };
                    }
                }
                cmd = cmd_rx.recv() => {
                    if let Some(outcome) = self.handle_command(cmd, &mut write, pending).await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: Option<Command>,
        write: &mut WsSink,
        pending: &mut Option<ConnectSignal>,
    ) -> Option<Outcome> {
        match cmd {
            None => {
                self.destroyed = true;
                Some(Outcome::Destroyed)
            }
            Some(Command::Send { op, data }) => {
                if let Err(e) = self
                    .send_envelope(write, &PayloadEnvelope::new(op, data))
                    .await
                {
                    self.resume_next = true;
                    return Some(Outcome::Retry { error: e.into() });
                }
                None
            }
            Some(Command::Disconnect { code, reason }) => {
                tracing::info!(code, %reason, "disconnect requested");
                _ = write.send(close_message(code, &reason)).await;
                _ = self.event_tx.send(GatewayEvent::ShardDisconnected {
                    shard_id: self.config.shard_id,
                    code,
                });
                match close::disposition(code) {
                    close::Disposition::Clean => Some(Outcome::Clean { code: Some(code) }),
                    _ => Some(Outcome::Stopped { code }),
                }
            }
            Some(Command::Connect { done }) => {
                tracing::info!("connect requested while a socket is open; cycling");
                _ = write
                    .send(close_message(close::RECONNECT_REQUESTED, "reconnecting"))
                    .await;
                if let Some(old) = pending.replace(done) {
                    _ = old.send(Err(Error::validation("superseded by a newer connect")));
                }
                self.resume_next = true;
                Some(Outcome::Restart)
            }
            Some(Command::Destroy) => {
                _ = write.send(close_message(close::NORMAL, "destroyed")).await;
                self.destroyed = true;
                Some(Outcome::Destroyed)
            }
        }
    }

    /// Route one transport message. Returns an outcome when the connection
    /// must end.
    async fn handle_message(
        &mut self,
        message: Message,
        resume: bool,
        write: &mut WsSink,
        timers: &mut Timers,
        pending: &mut Option<ConnectSignal>,
    ) -> Option<Outcome> {
        match message {
            Message::Text(text) => {
                self.handle_frame(text.as_bytes(), resume, write, timers, pending)
                    .await
            }
            Message::Binary(bytes) => {
                if let Some(service) = self.compression.as_mut() {
                    match service.decompress(&bytes) {
                        // Logical message still spans further frames.
                        Ok(None) => None,
                        Ok(Some(decompressed)) => {
                            self.handle_frame(&decompressed, resume, write, timers, pending)
                                .await
                        }
                        Err(e) => {
                            self.resume_next = true;
                            Some(Outcome::Retry { error: e.into() })
                        }
                    }
                } else {
                    self.handle_frame(&bytes, resume, write, timers, pending)
                        .await
                }
            }
            Message::Close(frame) => {
                let (code, reason) = match frame {
                    Some(f) => (u16::from(f.code), f.reason.to_string()),
                    None => (close::ABNORMAL, String::new()),
                };
                tracing::info!(code, %reason, "server closed the connection");
                _ = self.event_tx.send(GatewayEvent::ShardDisconnected {
                    shard_id: self.config.shard_id,
                    code,
                });
                match close::disposition(code) {
                    close::Disposition::Clean => Some(Outcome::Clean { code: Some(code) }),
                    close::Disposition::Fatal => Some(Outcome::Fatal { code, reason }),
                    close::Disposition::Resumable => {
                        self.resume_next = true;
                        Some(Outcome::Retry {
                            error: GatewayError::Closed { code, reason }.into(),
                        })
                    }
                }
            }
            // Ping and pong are answered by the transport.
            _ => None,
        }
    }

    async fn handle_frame(
        &mut self,
        bytes: &[u8],
        resume: bool,
        write: &mut WsSink,
        timers: &mut Timers,
        pending: &mut Option<ConnectSignal>,
    ) -> Option<Outcome> {
        match self.encoding.decode(bytes) {
            Ok(envelope) => {
                self.handle_envelope(envelope, resume, write, timers, pending)
                    .await
            }
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable frame");
                None
            }
        }
    }

    async fn handle_envelope(
        &mut self,
        envelope: PayloadEnvelope,
        resume: bool,
        write: &mut WsSink,
        timers: &mut Timers,
        pending: &mut Option<ConnectSignal>,
    ) -> Option<Outcome> {
        match envelope.op {
            Opcode::Hello => {
                let Some(interval_ms) =
                    envelope.d.get("heartbeat_interval").and_then(Value::as_u64)
                else {
                    self.resume_next = true;
                    return Some(Outcome::Retry {
                        error: GatewayError::Decode {
                            format: "hello",
                            source: "hello payload without heartbeat_interval".into(),
                        }
                        .into(),
                    });
                };

                let first = self.heartbeat.start(Duration::from_millis(interval_ms));
                timers.beat = Some(Box::pin(sleep(first)));
                tracing::debug!(
                    interval_ms,
                    first_beat_ms = first.as_millis() as u64,
                    "hello received; heartbeats armed"
                );

                if resume && self.session.can_resume() {
                    if let Err(e) = self.send_resume(write).await {
                        self.resume_next = true;
                        return Some(Outcome::Retry { error: e.into() });
                    }
                } else {
                    self.schedule_identify(Duration::ZERO, timers);
                }
                None
            }
            Opcode::Dispatch => self.handle_dispatch(envelope, pending),
            Opcode::Heartbeat => {
                // The server may demand an immediate beat at any time.
                if let Err(e) = self.send_heartbeat(write).await {
                    self.resume_next = true;
                    return Some(Outcome::Retry { error: e.into() });
                }
                None
            }
            Opcode::HeartbeatAck => {
                self.heartbeat.ack();
                _ = self.latency_tx.send(self.heartbeat.latency());
                None
            }
            Opcode::Reconnect => {
                tracing::info!("server requested reconnect");
                _ = write
                    .send(close_message(
                        close::RECONNECT_REQUESTED,
                        "server requested reconnect",
                    ))
                    .await;
                self.resume_next = true;
                Some(Outcome::Retry {
                    error: GatewayError::Closed {
                        code: close::RECONNECT_REQUESTED,
                        reason: "server requested reconnect".to_owned(),
                    }
                    .into(),
                })
            }
            Opcode::InvalidSession => {
                let resumable = envelope.d.as_bool().unwrap_or(false);
                if resumable && self.session.can_resume() {
                    tracing::warn!("session invalidated; cycling to resume");
                    self.resume_next = true;
                    return Some(Outcome::Retry {
                        error: GatewayError::InvalidSession.into(),
                    });
                }

                tracing::warn!("session invalidated; re-identifying with a fresh session");
                self.session.clear();
                self.resume_next = false;
                // The protocol requires a randomized wait before the new
                // identify. It runs on the serve loop's timer so frames,
                // heartbeats, and commands stay live meanwhile.
                let wait = Duration::from_secs_f64(rand::rng().random_range(1.0..5.0));
                self.schedule_identify(wait, timers);
                None
            }
            other => {
                tracing::debug!(op = ?other, "ignoring unexpected opcode");
                None
            }
        }
    }

    fn handle_dispatch(
        &mut self,
        envelope: PayloadEnvelope,
        pending: &mut Option<ConnectSignal>,
    ) -> Option<Outcome> {
        if let Some(sequence) = envelope.s {
            self.session.record_sequence(sequence);
        }
        let Some(event) = envelope.t else {
            tracing::warn!("dispatch without an event name");
            return None;
        };

        match event.as_str() {
            "READY" => {
                let session_id = envelope
                    .d
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let resume_url = envelope
                    .d
                    .get("resume_gateway_url")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                self.session.establish(session_id.clone(), resume_url);
                self.attempt.record_success();
                self.set_shard_status(ShardStatus::Ready);
                self.set_state(GatewayState::Ready);
                tracing::info!(%session_id, shard_id = self.config.shard_id, "session established");
                _ = self.event_tx.send(GatewayEvent::SessionStarted {
                    session_id,
                    shard_id: self.config.shard_id,
                });
                if let Some(done) = pending.take() {
                    _ = done.send(Ok(()));
                }
            }
            "RESUMED" => {
                self.attempt.record_success();
                self.set_shard_status(ShardStatus::Ready);
                self.set_state(GatewayState::Ready);
                let session_id = self.session.session_id.clone().unwrap_or_default();
                tracing::info!(%session_id, sequence = self.session.sequence, "session resumed");
                _ = self
                    .event_tx
                    .send(GatewayEvent::SessionResumed { session_id });
                if let Some(done) = pending.take() {
                    _ = done.send(Ok(()));
                }
            }
            "GUILD_CREATE" => {
                if let Some(guild_id) = guild_id(&envelope.d) {
                    if let Some(mut shards) = self.shards_lock() {
                        shards.add_guild_to_shard(guild_id);
                    }
                }
            }
            "GUILD_DELETE" => {
                // Unavailable guilds are outages, not removals.
                let unavailable = envelope
                    .d
                    .get("unavailable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !unavailable {
                    if let Some(guild_id) = guild_id(&envelope.d) {
                        if let Some(mut shards) = self.shards_lock() {
                            shards.remove_guild_from_shard(guild_id);
                        }
                    }
                }
            }
            _ => {}
        }

        _ = self.event_tx.send(GatewayEvent::Dispatch {
            event,
            payload: envelope.d,
        });
        None
    }

    async fn send_envelope(
        &self,
        write: &mut WsSink,
        envelope: &PayloadEnvelope,
    ) -> Result<(), GatewayError> {
        let message = match self.encoding.encode(envelope)? {
            EncodedFrame::Text(text) => Message::Text(text.into()),
            EncodedFrame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        write.send(message).await.map_err(GatewayError::Connection)
    }

    /// Heartbeat carrying the last seen sequence, or null before the first
    /// dispatch.
    async fn send_heartbeat(&mut self, write: &mut WsSink) -> Result<(), GatewayError> {
        let sequence = if self.session.sequence > 0 {
            json!(self.session.sequence)
        } else {
            Value::Null
        };
        self.send_envelope(write, &PayloadEnvelope::new(Opcode::Heartbeat, sequence))
            .await
    }

    /// Queue the identify on the serve loop's timer, adding the shard's
    /// concurrency bucket delay when a shard manager paces this gateway.
    /// The driver keeps serving frames and commands while the timer runs.
    fn schedule_identify(&mut self, wait: Duration, timers: &mut Timers) {
        self.set_state(GatewayState::Identifying);

        let shard_id = self.config.shard_id;
        let bucket = self
            .shards_lock()
            .map_or(Duration::ZERO, |m| m.identify_delay(shard_id));
        let total = wait + bucket;
        if total > Duration::ZERO {
            tracing::debug!(shard_id, delay_ms = total.as_millis() as u64, "identify deferred");
        }
        timers.identify = Some(Box::pin(sleep(total)));
    }

    async fn send_identify(&mut self, write: &mut WsSink) -> Result<(), GatewayError> {
        let shard = self.shard_tuple();
        if shard.is_some() {
            self.set_shard_status(ShardStatus::Identifying);
        }

        let d = payload::identify(
            self.config.token.expose_secret(),
            self.config.intents,
            &self.config.properties,
            shard,
            self.config.presence.as_ref(),
            self.config.large_threshold,
        );
        self.send_envelope(write, &PayloadEnvelope::new(Opcode::Identify, d))
            .await
    }

    async fn send_resume(&mut self, write: &mut WsSink) -> Result<(), GatewayError> {
        let Some(session_id) = self.session.session_id.clone() else {
            return Err(GatewayError::NotResumable);
        };
        self.set_state(GatewayState::Resuming);
        tracing::info!(%session_id, sequence = self.session.sequence, "resuming session");

        let d = payload::resume(
            self.config.token.expose_secret(),
            &session_id,
            self.session.sequence,
        );
        self.send_envelope(write, &PayloadEnvelope::new(Opcode::Resume, d))
            .await
    }

    fn set_state(&self, state: GatewayState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = %current, to = %state, "gateway state change");
            *current = state;
            true
        });
    }

    fn shards_lock(&self) -> Option<MutexGuard<'_, ShardManager>> {
        self.shards
            .as_ref()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn shard_tuple(&self) -> Option<[u32; 2]> {
        let shard_id = self.config.shard_id;
        self.shards_lock().map(|m| [shard_id, m.total_shards()])
    }

    fn set_shard_status(&self, status: ShardStatus) {
        let shard_id = self.config.shard_id;
        if let Some(mut shards) = self.shards_lock() {
            shards.set_shard_status(shard_id, status);
        }
    }

    fn reset_shard(&self) {
        let shard_id = self.config.shard_id;
        if let Some(mut shards) = self.shards_lock() {
            shards.reset_shard(shard_id);
        }
    }
}

/// Pending until the timer fires; never resolves while disarmed.
async fn timer_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

fn fail_pending(pending: &mut Option<ConnectSignal>, error: Error) {
    if let Some(done) = pending.take() {
        _ = done.send(Err(error));
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    }))
}

/// Guild ids arrive as snowflake strings in JSON and integers in ETF.
fn guild_id(d: &Value) -> Option<u64> {
    match d.get("id") {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    }
}
