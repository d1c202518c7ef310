//! Connection session: one physical socket and its reconnect state machine.
//!
//! The session runs as a background tokio task. Its state is an explicit
//! [`ConnectionState`] driven through [`ConnectionState::next`]; every change
//! is published as a [`SessionEvent::Lifecycle`] and on a `watch` channel.
//!
//! - Exponential backoff, `min(max_delay, base_delay * 2^attempt)`
//! - Hard cap on consecutive failed reconnects, then EXITING
//! - Protocol-level ping/pong health check
//! - Inbound text frames forwarded in wire order with backpressure

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::websocket::error::{WebSocketError, WsResult};
use crate::websocket::transport::{BoxTransport, Connector, Endpoint, TungsteniteConnector};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base delay for exponential backoff (ms)
    pub base_delay_ms: u64,
    /// Maximum delay for exponential backoff (ms)
    pub max_delay_ms: u64,
    /// Consecutive failed reconnects before the session gives up
    pub max_reconnect_attempts: u32,
    /// Randomize each backoff delay in `0..=delay`
    pub backoff_jitter: bool,
    /// Interval for client ping (ms)
    pub ping_interval_ms: u64,
    /// Grace window for the matching pong (ms)
    pub pong_timeout_ms: u64,
    /// Capacity of the event channel
    pub event_channel_capacity: usize,
    /// Capacity of the command channel
    pub command_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_reconnect_attempts: 5,
            backoff_jitter: false,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            event_channel_capacity: 1000,
            command_channel_capacity: 100,
        }
    }
}

// ─── State machine ───────────────────────────────────────────────────────────

/// Connection state. EXITING is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialising,
    Streaming,
    Reconnecting,
    Exiting,
}

/// Inputs to the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    HandshakeSucceeded,
    HandshakeFailed,
    TransportFailed,
    CloseRequested,
    RetriesExhausted,
}

impl ConnectionState {
    /// Transition table. `None` means the input is not valid in this state.
    pub fn next(self, input: SessionInput) -> Option<ConnectionState> {
        use ConnectionState::*;
        use SessionInput::*;

        match (self, input) {
            (Exiting, _) => None,
            (_, CloseRequested) => Some(Exiting),
            (Initialising, HandshakeSucceeded) | (Reconnecting, HandshakeSucceeded) => {
                Some(Streaming)
            }
            (Initialising, HandshakeFailed) => Some(Reconnecting),
            (Reconnecting, HandshakeFailed) => Some(Reconnecting),
            (Streaming, TransportFailed) => Some(Reconnecting),
            (Reconnecting, RetriesExhausted) => Some(Exiting),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Exiting
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initialising => "INITIALISING",
            ConnectionState::Streaming => "STREAMING",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Exiting => "EXITING",
        };
        f.write_str(name)
    }
}

/// Reconnect backoff.
///
/// `attempt` counts consecutive failed reconnects; the wait before the next
/// attempt is `min(max, base * 2^attempt)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
            jitter: false,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_reconnect_attempts,
        )
        .with_jitter(config.backoff_jitter)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Consecutive failed attempts so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic wait for a given attempt number
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Wait before the next attempt, jittered when enabled
    pub fn delay(&self) -> Duration {
        let delay = self.delay_for(self.attempt);
        if self.jitter {
            let max_ms = delay.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
        } else {
            delay
        }
    }

    /// Count a failed attempt. Returns whether any budget remains.
    pub fn record_failure(&mut self) -> bool {
        self.attempt = self.attempt.saturating_add(1);
        !self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub session: SessionId,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: Option<String>,
}

/// Events emitted by a session to its owner
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    Lifecycle(Transition),
    /// Inbound text frame, in wire order
    Frame(String),
    /// Frame that could not be read as text; the session keeps running
    ProtocolError(String),
    /// Retry budget exhausted; the session is in EXITING for good
    Fatal {
        session: SessionId,
        error: WebSocketError,
    },
}

// ─── Commands from public API to background task ─────────────────────────────

enum Command {
    Send {
        text: String,
        ack: oneshot::Sender<WsResult<()>>,
    },
    ForceReconnect(String),
    Close,
}

/// Cloneable handle for writing to a session
#[derive(Clone)]
pub struct SessionSender {
    id: SessionId,
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl fmt::Debug for SessionSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSender")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionSender {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Send a text frame. Fails with `NotConnected` unless STREAMING.
    pub async fn send_text(&self, text: String) -> WsResult<()> {
        if self.state() != ConnectionState::Streaming {
            return Err(WebSocketError::NotConnected);
        }
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { text, ack })
            .await
            .map_err(|_| WebSocketError::ChannelClosed)?;
        ack_rx.await.map_err(|_| WebSocketError::ChannelClosed)?
    }

    /// Serialize and send a JSON frame
    pub async fn send_json<T: Serialize>(&self, msg: &T) -> WsResult<()> {
        let json = serde_json::to_string(msg)?;
        self.send_text(json).await
    }

    /// Drop the current socket and go through RECONNECTING
    pub async fn force_reconnect(&self, reason: impl Into<String>) -> WsResult<()> {
        self.cmd_tx
            .send(Command::ForceReconnect(reason.into()))
            .await
            .map_err(|_| WebSocketError::ChannelClosed)
    }
}

// ─── Public session ──────────────────────────────────────────────────────────

/// A single resilient WebSocket connection.
///
/// # Example
///
/// ```ignore
/// let (session, mut events) = ConnectionSession::connect(
///     "wss://stream.binance.com:9443/ws/btcusdt@trade",
///     SessionConfig::default(),
/// );
/// while let Some(event) = events.recv().await {
///     if let SessionEvent::Frame(text) = event {
///         println!("{text}");
///     }
/// }
/// ```
pub struct ConnectionSession {
    id: SessionId,
    sender: SessionSender,
    state_rx: watch::Receiver<ConnectionState>,
    task_handle: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    /// Spawn a session that dials `url` with the default connector.
    pub fn connect(url: &str, config: SessionConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        Self::spawn(
            config,
            Arc::new(url.to_string()),
            Arc::new(TungsteniteConnector::default()),
        )
    }

    /// Spawn the background task. Must be called within a tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        endpoint: Arc<dyn Endpoint>,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let id = SessionId::next();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initialising);

        let task = SessionTask {
            id,
            backoff: Backoff::from_config(&config),
            config,
            endpoint,
            connector,
            event_tx,
            cmd_rx,
            state: ConnectionState::Initialising,
            state_tx,
        };
        let handle = tokio::spawn(task.run());

        let sender = SessionSender {
            id,
            cmd_tx,
            state_rx: state_rx.clone(),
        };

        (
            Self {
                id,
                sender,
                state_rx,
                task_handle: Some(handle),
            },
            event_rx,
        )
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Check if streaming
    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub async fn send_text(&self, text: String) -> WsResult<()> {
        self.sender.send_text(text).await
    }

    pub async fn force_reconnect(&self, reason: impl Into<String>) -> WsResult<()> {
        self.sender.force_reconnect(reason).await
    }

    /// Wait until the session reaches `target` or EXITING.
    pub async fn wait_for(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.state_rx.clone();
        let result = rx
            .wait_for(|state| *state == target || state.is_terminal())
            .await
            .map(|state| *state);
        result.unwrap_or(ConnectionState::Exiting)
    }

    /// Close the session and wait for the task to finish.
    pub async fn close(&mut self) -> WsResult<()> {
        let _ = self.sender.cmd_tx.send(Command::Close).await;

        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        Ok(())
    }

    /// Check if the background task is still running
    pub fn is_task_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

enum Handshake {
    Connected(BoxTransport),
    Failed(WebSocketError),
    Cancelled,
}

enum StreamExit {
    TransportFailed(String),
    CloseRequested,
}

struct SessionTask {
    id: SessionId,
    config: SessionConfig,
    endpoint: Arc<dyn Endpoint>,
    connector: Arc<dyn Connector>,
    event_tx: mpsc::Sender<SessionEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    backoff: Backoff,
}

impl SessionTask {
    async fn run(mut self) {
        // owned by the loop, never by the task struct
        let mut transport: Option<BoxTransport> = None;
        loop {
            match self.state {
                ConnectionState::Initialising | ConnectionState::Reconnecting => {
                    transport = self.connect_step().await;
                }
                ConnectionState::Streaming => match transport.take() {
                    Some(transport) => match self.stream_step(transport).await {
                        StreamExit::TransportFailed(reason) => {
                            self.transition(SessionInput::TransportFailed, Some(reason))
                                .await;
                        }
                        StreamExit::CloseRequested => {
                            self.transition(SessionInput::CloseRequested, None).await;
                        }
                    },
                    None => {
                        self.transition(
                            SessionInput::TransportFailed,
                            Some("No transport".to_string()),
                        )
                        .await;
                    }
                },
                ConnectionState::Exiting => break,
            }
        }
        tracing::debug!("{} task finished", self.id);
    }

    /// One handshake attempt from INITIALISING or RECONNECTING. Returns the
    /// socket when the session moved to STREAMING.
    async fn connect_step(&mut self) -> Option<BoxTransport> {
        if self.state == ConnectionState::Reconnecting {
            let delay = self.backoff.delay();
            tracing::info!(
                "{} reconnect attempt {}/{} in {}ms",
                self.id,
                self.backoff.attempt() + 1,
                self.backoff.max_attempts(),
                delay.as_millis()
            );
            if !self.sleep_or_close(delay).await {
                self.transition(SessionInput::CloseRequested, None).await;
                return None;
            }
        }

        match self.handshake().await {
            Handshake::Connected(transport) => {
                self.transition(SessionInput::HandshakeSucceeded, None).await;
                return Some(transport);
            }
            Handshake::Cancelled => {
                self.transition(SessionInput::CloseRequested, None).await;
            }
            Handshake::Failed(e) => {
                tracing::warn!("{} handshake failed: {}", self.id, e);
                if self.state == ConnectionState::Initialising {
                    self.transition(SessionInput::HandshakeFailed, Some(e.to_string()))
                        .await;
                } else if self.backoff.record_failure() {
                    self.transition(SessionInput::HandshakeFailed, Some(e.to_string()))
                        .await;
                } else {
                    let attempts = self.backoff.attempt();
                    tracing::error!(
                        "{} giving up after {} failed reconnect attempts",
                        self.id,
                        attempts
                    );
                    self.transition(SessionInput::RetriesExhausted, Some(e.to_string()))
                        .await;
                    self.emit(SessionEvent::Fatal {
                        session: self.id,
                        error: WebSocketError::RetriesExhausted { attempts },
                    })
                    .await;
                }
            }
        }
        None
    }

    async fn handshake(&mut self) -> Handshake {
        let endpoint = Arc::clone(&self.endpoint);
        let connector = Arc::clone(&self.connector);
        let attempt = async move {
            let url = endpoint.resolve().await?;
            tracing::debug!("Dialing {}", url);
            connector.connect(url).await
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(transport) => Handshake::Connected(transport),
                        Err(e) => Handshake::Failed(e),
                    };
                }
                cmd = self.cmd_rx.recv() => {
                    if !self.handle_offline_command(cmd) {
                        return Handshake::Cancelled;
                    }
                }
            }
        }
    }

    /// Returns `false` if a close was requested during the wait.
    async fn sleep_or_close(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => {
                    if !self.handle_offline_command(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    /// Commands while no socket is open. Returns `false` on close.
    fn handle_offline_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Send { ack, .. }) => {
                let _ = ack.send(Err(WebSocketError::NotConnected));
                true
            }
            Some(Command::ForceReconnect(_)) => true,
            Some(Command::Close) | None => false,
        }
    }

    /// The connected loop, runs until the socket breaks or a close is requested.
    async fn stream_step(&mut self, transport: BoxTransport) -> StreamExit {
        let (mut sink, mut stream) = transport.split();

        let ping_dur = Duration::from_millis(self.config.ping_interval_ms.max(1));
        let pong_dur = Duration::from_millis(self.config.pong_timeout_ms);

        let mut ping_interval = tokio::time::interval(ping_dur);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_interval.reset(); // skip immediate first tick

        let mut awaiting_pong = false;
        let far_future = Instant::now() + Duration::from_secs(86400);
        let pong_sleep = tokio::time::sleep_until(far_future);
        tokio::pin!(pong_sleep);

        loop {
            tokio::select! {
                // ── a) Incoming WS message ───────────────────────────────────
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.emit(SessionEvent::Frame(text.as_str().to_owned())).await {
                                let _ = sink.close().await;
                                return StreamExit::CloseRequested;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let event = match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => SessionEvent::Frame(text),
                                Err(e) => SessionEvent::ProtocolError(format!(
                                    "Binary frame is not UTF-8: {}",
                                    e
                                )),
                            };
                            if !self.emit(event).await {
                                let _ = sink.close().await;
                                return StreamExit::CloseRequested;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                return StreamExit::TransportFailed(format!(
                                    "Failed to send pong: {}",
                                    e
                                ));
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            awaiting_pong = false;
                            pong_sleep.as_mut().reset(far_future);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = extract_close(frame.as_ref());
                            tracing::info!("{} closed by server: code {}, reason: {}", self.id, code, reason);
                            return StreamExit::TransportFailed(format!(
                                "Closed by server: code {}, reason: {}",
                                code, reason
                            ));
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            tracing::error!("{} WebSocket error: {}", self.id, e);
                            return StreamExit::TransportFailed(e.to_string());
                        }
                        None => {
                            return StreamExit::TransportFailed("Stream ended".to_string());
                        }
                    }
                }

                // ── b) Command from public API ───────────────────────────────
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send { text, ack }) => {
                            let result = sink
                                .send(Message::Text(text.into()))
                                .await
                                .map_err(WebSocketError::from);
                            let failure = result.as_ref().err().map(|e| e.to_string());
                            let _ = ack.send(result);
                            if let Some(reason) = failure {
                                return StreamExit::TransportFailed(reason);
                            }
                        }
                        Some(Command::ForceReconnect(reason)) => {
                            tracing::info!("{} forced reconnect: {}", self.id, reason);
                            let _ = sink.close().await;
                            return StreamExit::TransportFailed(reason);
                        }
                        Some(Command::Close) | None => {
                            let _ = sink.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Client disconnect".into(),
                            }))).await;
                            return StreamExit::CloseRequested;
                        }
                    }
                }

                // ── c) Ping interval ─────────────────────────────────────────
                _ = ping_interval.tick() => {
                    if !awaiting_pong {
                        if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                            return StreamExit::TransportFailed(format!("Failed to send ping: {}", e));
                        }
                        awaiting_pong = true;
                        pong_sleep.as_mut().reset(Instant::now() + pong_dur);
                    }
                }

                // ── d) Pong timeout ──────────────────────────────────────────
                () = &mut pong_sleep, if awaiting_pong => {
                    tracing::warn!(
                        "{} pong timeout: no response within {}ms",
                        self.id,
                        self.config.pong_timeout_ms
                    );
                    let _ = sink.close().await;
                    return StreamExit::TransportFailed(WebSocketError::PingTimeout.to_string());
                }
            }
        }
    }

    async fn transition(&mut self, input: SessionInput, reason: Option<String>) {
        let Some(next) = self.state.next(input) else {
            tracing::warn!("{} ignoring {:?} in state {}", self.id, input, self.state);
            return;
        };
        if next == self.state {
            return;
        }

        let from = self.state;
        self.state = next;
        // attempt counter restarts on every entry into RECONNECTING
        if matches!(
            next,
            ConnectionState::Streaming | ConnectionState::Reconnecting
        ) {
            self.backoff.reset();
        }
        self.state_tx.send_replace(next);

        match &reason {
            Some(reason) => tracing::info!("{} {} -> {} ({})", self.id, from, next, reason),
            None => tracing::info!("{} {} -> {}", self.id, from, next),
        }

        self.emit(SessionEvent::Lifecycle(Transition {
            session: self.id,
            from,
            to: next,
            reason,
        }))
        .await;
    }

    /// Returns `false` once the owner has dropped the event receiver.
    async fn emit(&self, event: SessionEvent) -> bool {
        self.event_tx.send(event).await.is_ok()
    }
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1006, "No close frame".into()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
