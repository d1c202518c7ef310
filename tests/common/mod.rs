//! In-memory WebSocket harness shared by the integration tests.
//!
//! [`MockConnector`] hands the session a [`MockTransport`] and the test the
//! matching [`MockServer`], so tests play the exchange side without a socket.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use binance_streams::network::Endpoints;
use binance_streams::websocket::{
    BoxTransport, Connector, MultiplexerConfig, SessionConfig, WebSocketError, WsResult,
};
use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message};

pub const MOCK_BASE: &str = "ws://mock";

/// Upper bound for any single wait in a test
pub const WAIT: Duration = Duration::from_secs(5);

/// Fast backoff, no heartbeat interference.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        base_delay_ms: 5,
        max_delay_ms: 40,
        ping_interval_ms: 3_600_000,
        pong_timeout_ms: 3_600_000,
        ..SessionConfig::default()
    }
}

pub fn mock_endpoints() -> Endpoints {
    Endpoints {
        spot: MOCK_BASE.to_string(),
        usd_futures: MOCK_BASE.to_string(),
        coin_futures: MOCK_BASE.to_string(),
        options: MOCK_BASE.to_string(),
    }
}

pub fn mock_multiplexer_config() -> MultiplexerConfig {
    MultiplexerConfig {
        endpoints: mock_endpoints(),
        session: fast_session_config(),
        request_timeout: Duration::from_secs(2),
        ..MultiplexerConfig::default()
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Client side of an in-memory socket
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Result<Message, TungsteniteError>>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Stream for MockTransport {
    type Item = Result<Message, TungsteniteError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<Message> for MockTransport {
    type Error = TungsteniteError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.outbound
            .send(item)
            .map_err(|_| TungsteniteError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Exchange side of one accepted connection. Dropping it ends the client's
/// inbound stream, which the session treats as a lost connection.
pub struct MockServer {
    pub url: String,
    to_client: mpsc::UnboundedSender<Result<Message, TungsteniteError>>,
    from_client: mpsc::UnboundedReceiver<Message>,
}

impl MockServer {
    pub fn send_text(&self, text: impl Into<String>) {
        let text: String = text.into();
        let _ = self.to_client.send(Ok(Message::Text(text.into())));
    }

    pub fn send_message(&self, msg: Message) {
        let _ = self.to_client.send(Ok(msg));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    /// Combined-stream push
    pub fn push(&self, stream: &str, data: Value) {
        self.send_json(json!({ "stream": stream, "data": data }));
    }

    pub fn ack(&self, id: u64) {
        self.send_json(json!({ "result": null, "id": id }));
    }

    pub fn reply(&self, id: u64, result: Value) {
        self.send_json(json!({ "result": result, "id": id }));
    }

    pub fn reject(&self, id: u64, code: i64, msg: &str) {
        self.send_json(json!({ "error": { "code": code, "msg": msg }, "id": id }));
    }

    /// Fail the client's read with a transport error.
    pub fn break_connection(&self) {
        let _ = self
            .to_client
            .send(Err(TungsteniteError::ConnectionClosed));
    }

    /// Next frame from the client, heartbeats included.
    pub async fn recv_raw(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .ok()?
    }

    /// Next frame from the client, heartbeats skipped.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let msg = tokio::time::timeout(WAIT, self.from_client.recv())
                .await
                .ok()??;
            match msg {
                Message::Ping(_) | Message::Pong(_) => continue,
                other => return Some(other),
            }
        }
    }

    /// Next JSON request from the client.
    pub async fn recv_request(&mut self) -> Value {
        match self.recv().await {
            Some(Message::Text(text)) => {
                serde_json::from_str(text.as_str()).expect("request is not JSON")
            }
            other => panic!("expected a text request, got {:?}", other),
        }
    }

    /// Acknowledge SUBSCRIBE frames until every key in `expected` was
    /// requested. Returns the number of SUBSCRIBE frames seen.
    pub async fn ack_subscriptions(&mut self, expected: &[&str]) -> usize {
        let mut seen: Vec<String> = Vec::new();
        let mut frames = 0;
        while !expected.iter().all(|key| seen.iter().any(|s| s == key)) {
            let request = self.recv_request().await;
            assert_eq!(request["method"], "SUBSCRIBE", "unexpected request {request}");
            let id = request["id"].as_u64().expect("request id");
            if let Some(params) = request["params"].as_array() {
                seen.extend(params.iter().filter_map(Value::as_str).map(String::from));
            }
            frames += 1;
            self.ack(id);
        }
        frames
    }

    /// True once the client has closed its side.
    pub async fn closed_by_client(&mut self) -> bool {
        loop {
            match self.recv().await {
                Some(Message::Close(_)) | None => return true,
                Some(_) => continue,
            }
        }
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// What the connector does with one dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Accept,
    Refuse,
}

/// Scripted connector. Each dial consumes the next scripted outcome, then
/// falls back to `fallback`.
pub struct MockConnector {
    script: Mutex<VecDeque<Dial>>,
    fallback: Dial,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    pub fn new(
        script: Vec<Dial>,
        fallback: Dial,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, servers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            attempts: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            servers,
        });
        (connector, servers_rx)
    }

    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        Self::new(Vec::new(), Dial::Accept)
    }

    pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        Self::new(Vec::new(), Dial::Refuse)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, WsResult<BoxTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        let dial = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        let result = match dial {
            Dial::Refuse => Err(WebSocketError::ConnectionFailed(format!(
                "{} refused",
                url
            ))),
            Dial::Accept => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let server = MockServer {
                    url,
                    to_client,
                    from_client,
                };
                match self.servers.send(server) {
                    Ok(()) => Ok(Box::pin(MockTransport { inbound, outbound }) as BoxTransport),
                    Err(_) => Err(WebSocketError::ConnectionFailed(
                        "Mock server gone".to_string(),
                    )),
                }
            }
        };
        Box::pin(async move { result })
    }
}

/// Next accepted connection.
pub async fn next_server(servers: &mut mpsc::UnboundedReceiver<MockServer>) -> MockServer {
    tokio::time::timeout(WAIT, servers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Let in-flight frames settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
