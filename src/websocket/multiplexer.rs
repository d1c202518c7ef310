//! Stream multiplexer.
//!
//! Shares combined-stream sockets between subscriptions of the same market
//! family, dispatches inbound frames to the right subscriber, and replays
//! SUBSCRIBE frames whenever a session (re)connects.
//!
//! # Example
//!
//! ```ignore
//! let mux = Multiplexer::new(MultiplexerConfig::default());
//! let (handle, mut trades) = mux
//!     .subscribe_channel(MarketFamily::Spot, "btcusdt@trade", 1024)
//!     .await?;
//!
//! while let Some(item) = trades.next().await {
//!     if let StreamItem::Message(msg) = item {
//!         println!("{}: {}", msg.stream, msg.data);
//!     }
//! }
//! mux.unsubscribe(handle).await?;
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::network::{Endpoints, MarketFamily};
use crate::websocket::error::{WebSocketError, WsResult};
use crate::websocket::router::{RequestRouter, RouteOutcome, DEFAULT_REQUEST_TIMEOUT};
use crate::websocket::session::{
    ConnectionSession, ConnectionState, SessionConfig, SessionEvent, SessionId, Transition,
};
use crate::websocket::transport::{Connector, TungsteniteConnector};
use crate::websocket::types::StreamItem;

pub use crate::websocket::router::SubscriptionId;

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Per-family base URLs
    pub endpoints: Endpoints,
    /// Configuration for every session the multiplexer opens
    pub session: SessionConfig,
    /// Distinct stream keys carried by one socket before a new one is opened
    pub max_streams_per_session: usize,
    /// Timeout for SUBSCRIBE acknowledgements and other requests
    pub request_timeout: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            session: SessionConfig::default(),
            max_streams_per_session: 200,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_capacity: 256,
        }
    }
}

/// Returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub family: MarketFamily,
    pub stream_key: String,
    pub session: SessionId,
}

/// Events published by the multiplexer
#[derive(Debug, Clone)]
pub enum MultiplexerEvent {
    /// A session changed state
    Session {
        family: MarketFamily,
        transition: Transition,
    },
    /// SUBSCRIBE replayed after a (re)connect
    Resubscribed {
        family: MarketFamily,
        session: SessionId,
        streams: usize,
    },
    /// Unparseable or undecodable frame; the session keeps running
    ProtocolError {
        family: MarketFamily,
        session: SessionId,
        message: String,
    },
    /// A session gave up; its subscriptions are closed
    Fatal {
        family: MarketFamily,
        session: SessionId,
        error: WebSocketError,
    },
}

pin_project! {
    /// Subscription delivered as a `Stream`. Owns the strong sender; the
    /// multiplexer only holds a weak one, so dropping this ends delivery.
    /// The stream ends after yielding `StreamItem::Closed`.
    pub struct SubscriptionStream {
        rx: mpsc::Receiver<StreamItem>,
        tx: Option<mpsc::Sender<StreamItem>>,
        finished: bool,
    }
}

impl SubscriptionStream {
    fn new(rx: mpsc::Receiver<StreamItem>, tx: mpsc::Sender<StreamItem>) -> Self {
        Self {
            rx,
            tx: Some(tx),
            finished: false,
        }
    }
}

impl Stream for SubscriptionStream {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamItem>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if matches!(item, StreamItem::Closed { .. }) {
                    *this.finished = true;
                    this.tx.take();
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct SessionEntry {
    family: MarketFamily,
    session: ConnectionSession,
    router: Arc<RequestRouter>,
    dispatch_handle: JoinHandle<()>,
}

impl SessionEntry {
    fn id(&self) -> SessionId {
        self.session.id()
    }

    fn is_exiting(&self) -> bool {
        self.session.state().is_terminal()
    }

    async fn close(mut self) {
        let _ = self.session.close().await;
        // dispatch ends once the session's event channel closes
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.dispatch_handle).await;
        self.dispatch_handle.abort();
    }
}

#[derive(Default)]
struct Registry {
    sessions: Vec<SessionEntry>,
    subscriptions: HashMap<SubscriptionId, SubscriptionHandle>,
}

impl Registry {
    fn position(&self, session: SessionId) -> Option<usize> {
        self.sessions.iter().position(|entry| entry.id() == session)
    }
}

/// Registry of subscriptions over shared sessions.
pub struct Multiplexer {
    config: MultiplexerConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<Mutex<Registry>>,
    next_subscription_id: AtomicU64,
    events_tx: broadcast::Sender<MultiplexerEvent>,
    /// Dropped-frame totals of sessions already removed
    retired_dropped: Arc<AtomicU64>,
    shut_down: AtomicBool,
}

impl Multiplexer {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self::with_connector(config, Arc::new(TungsteniteConnector::default()))
    }

    pub fn with_connector(config: MultiplexerConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            connector,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_subscription_id: AtomicU64::new(1),
            events_tx,
            retired_dropped: Arc::new(AtomicU64::new(0)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Subscribe to lifecycle, protocol and fatal events
    pub fn events(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.events_tx.subscribe()
    }

    /// Events as a `Stream`. Lagged events are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = MultiplexerEvent> + Send + 'static {
        let mut rx = self.events_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Multiplexer event stream lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Subscribe `target` to `stream_key`.
    ///
    /// The multiplexer holds `target` weakly; the caller keeps the strong
    /// sender alive for as long as it wants delivery.
    pub async fn subscribe(
        &self,
        family: MarketFamily,
        stream_key: &str,
        target: mpsc::WeakSender<StreamItem>,
    ) -> WsResult<SubscriptionHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(WebSocketError::SessionClosed);
        }

        let (handle, router, send_now) = {
            let mut guard = self.registry.lock().await;
            let registry = &mut *guard;
            self.prune_exited(registry).await;
            release_dead_targets(registry, &self.retired_dropped).await;

            let index = self.select_session(registry, family, stream_key);
            let entry = &registry.sessions[index];
            let router = Arc::clone(&entry.router);

            let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
            let handle = SubscriptionHandle {
                id,
                family,
                stream_key: stream_key.to_string(),
                session: entry.id(),
            };

            let first_for_key = !router.has_stream(stream_key);
            router.add_handler(stream_key, id, target);
            registry.subscriptions.insert(id, handle.clone());
            // not streaming yet: the (re)connect path subscribes every key
            let send_now = first_for_key && entry.session.is_streaming();
            (handle, router, send_now)
        };

        // the registry lock is released so shutdown can cancel the ack
        if send_now {
            let ack = match router.subscribe(&[stream_key.to_string()]).await {
                Ok(pending) => pending.wait().await,
                Err(e) => Err(e),
            };
            match ack {
                Ok(_) => {}
                Err(e) if e.is_application_error() => {
                    tracing::warn!("SUBSCRIBE {} rejected: {}", stream_key, e);
                    self.forget(&handle).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        "SUBSCRIBE {} not acknowledged ({}), left to the reconnect path",
                        stream_key,
                        e
                    );
                }
            }
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(WebSocketError::Cancelled);
        }

        tracing::info!("Subscribed {} on {} ({})", stream_key, handle.session, family);
        Ok(handle)
    }

    /// Subscribe with a fresh bounded channel.
    pub async fn subscribe_channel(
        &self,
        family: MarketFamily,
        stream_key: &str,
        capacity: usize,
    ) -> WsResult<(SubscriptionHandle, SubscriptionStream)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = self.subscribe(family, stream_key, tx.downgrade()).await?;
        Ok((handle, SubscriptionStream::new(rx, tx)))
    }

    /// Remove a subscription. A session left without subscriptions is closed.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> WsResult<()> {
        let router = {
            let mut guard = self.registry.lock().await;
            let registry = &mut *guard;
            let Some(handle) = registry.subscriptions.remove(&handle.id) else {
                return Ok(());
            };
            let Some(index) = registry.position(handle.session) else {
                return Ok(());
            };

            let entry = &registry.sessions[index];
            let last_for_key = entry.router.remove_handler(&handle.stream_key, handle.id);

            if entry.router.handler_count() == 0 {
                let entry = registry.sessions.swap_remove(index);
                tracing::info!("Closing idle {} ({})", entry.id(), entry.family);
                self.retired_dropped
                    .fetch_add(entry.router.dropped_frames(), Ordering::Relaxed);
                entry.close().await;
                return Ok(());
            }

            (last_for_key && entry.session.is_streaming()).then(|| Arc::clone(&entry.router))
        };

        if let Some(router) = router {
            send_unsubscribe(router, vec![handle.stream_key.clone()]).await;
        }
        tracing::info!("Unsubscribed {}", handle.stream_key);
        Ok(())
    }

    /// Roll back a registration whose SUBSCRIBE was rejected.
    async fn forget(&self, handle: &SubscriptionHandle) {
        let mut registry = self.registry.lock().await;
        registry.subscriptions.remove(&handle.id);
        if let Some(index) = registry.position(handle.session) {
            registry.sessions[index]
                .router
                .remove_handler(&handle.stream_key, handle.id);
        }
    }

    /// Request-style call on a session of `family`.
    pub async fn request(
        &self,
        family: MarketFamily,
        method: &str,
        params: Option<Value>,
    ) -> WsResult<Value> {
        let router = {
            let registry = self.registry.lock().await;
            registry
                .sessions
                .iter()
                .filter(|entry| entry.family == family && !entry.is_exiting())
                .max_by_key(|entry| entry.session.is_streaming())
                .map(|entry| Arc::clone(&entry.router))
        };
        let router = router.ok_or(WebSocketError::NotConnected)?;
        router.send(method, params).await?.wait().await
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    /// Number of registered subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.registry.lock().await.subscriptions.len()
    }

    /// Frames dropped because they matched nothing, across all sessions
    pub async fn dropped_frames(&self) -> u64 {
        let registry = self.registry.lock().await;
        let live: u64 = registry
            .sessions
            .iter()
            .map(|entry| entry.router.dropped_frames())
            .sum();
        live + self.retired_dropped.load(Ordering::Relaxed)
    }

    /// States of the live sessions
    pub async fn session_states(&self) -> Vec<(SessionId, MarketFamily, ConnectionState)> {
        self.registry
            .lock()
            .await
            .sessions
            .iter()
            .map(|entry| (entry.id(), entry.family, entry.session.state()))
            .collect()
    }

    /// Close every session and cancel every pending request.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut registry = self.registry.lock().await;
        registry.subscriptions.clear();

        let entries: Vec<SessionEntry> = registry.sessions.drain(..).collect();
        for entry in &entries {
            entry.router.fail_pending(WebSocketError::Cancelled);
            entry.router.close_handlers("Multiplexer shut down");
        }
        for entry in entries {
            self.retired_dropped
                .fetch_add(entry.router.dropped_frames(), Ordering::Relaxed);
            entry.close().await;
        }
        tracing::info!("Multiplexer shut down");
    }

    fn select_session(
        &self,
        registry: &mut Registry,
        family: MarketFamily,
        stream_key: &str,
    ) -> usize {
        let candidates = || {
            registry
                .sessions
                .iter()
                .enumerate()
                .filter(move |(_, entry)| entry.family == family && !entry.is_exiting())
        };

        if let Some((index, _)) =
            candidates().find(|(_, entry)| entry.router.has_stream(stream_key))
        {
            return index;
        }
        if let Some((index, _)) = candidates().find(|(_, entry)| {
            entry.router.stream_keys().len() < self.config.max_streams_per_session
        }) {
            return index;
        }

        registry.sessions.push(self.open_session(family));
        registry.sessions.len() - 1
    }

    fn open_session(&self, family: MarketFamily) -> SessionEntry {
        let url = self.config.endpoints.combined_stream_url(family);
        let (session, events) = ConnectionSession::spawn(
            self.config.session.clone(),
            Arc::new(url.clone()),
            Arc::clone(&self.connector),
        );
        let router = Arc::new(RequestRouter::new(session.sender(), self.config.request_timeout));
        let dispatch_handle = tokio::spawn(dispatch(
            family,
            session.id(),
            events,
            Arc::clone(&router),
            self.events_tx.clone(),
            Arc::downgrade(&self.registry),
            Arc::clone(&self.retired_dropped),
        ));
        tracing::info!("Opened {} for {} at {}", session.id(), family, url);

        SessionEntry {
            family,
            session,
            router,
            dispatch_handle,
        }
    }

    async fn prune_exited(&self, registry: &mut Registry) {
        let mut index = 0;
        while index < registry.sessions.len() {
            if !registry.sessions[index].is_exiting() {
                index += 1;
                continue;
            }
            let entry = registry.sessions.swap_remove(index);
            let session = entry.id();
            registry
                .subscriptions
                .retain(|_, handle| handle.session != session);
            self.retired_dropped
                .fetch_add(entry.router.dropped_frames(), Ordering::Relaxed);
            tracing::debug!("Pruned exited {}", session);
            entry.close().await;
        }
    }
}

/// Drop subscriptions whose receivers went away without unsubscribing.
///
/// Keys left without a target are unsubscribed on the wire; sessions left
/// without any target are closed.
async fn release_dead_targets(registry: &mut Registry, retired_dropped: &AtomicU64) {
    let mut index = 0;
    while index < registry.sessions.len() {
        let entry = &registry.sessions[index];
        let (removed, emptied) = entry.router.prune_dead_targets();
        if removed.is_empty() {
            index += 1;
            continue;
        }
        for id in &removed {
            registry.subscriptions.remove(id);
        }
        tracing::info!(
            "Released {} abandoned subscriptions on {}",
            removed.len(),
            entry.id()
        );

        if entry.router.handler_count() == 0 {
            let entry = registry.sessions.swap_remove(index);
            tracing::info!("Closing idle {} ({})", entry.id(), entry.family);
            retired_dropped.fetch_add(entry.router.dropped_frames(), Ordering::Relaxed);
            entry.close().await;
            continue;
        }
        if !emptied.is_empty() && entry.session.is_streaming() {
            tokio::spawn(send_unsubscribe(Arc::clone(&entry.router), emptied));
        }
        index += 1;
    }
}

async fn send_unsubscribe(router: Arc<RequestRouter>, stream_keys: Vec<String>) {
    match router.unsubscribe(&stream_keys).await {
        Ok(pending) => {
            if let Err(e) = pending.wait().await {
                tracing::warn!("UNSUBSCRIBE {:?} failed: {}", stream_keys, e);
            }
        }
        Err(e) => tracing::debug!("UNSUBSCRIBE {:?} not sent: {}", stream_keys, e),
    }
}

/// Per-session event loop: routes frames and reacts to state changes.
async fn dispatch(
    family: MarketFamily,
    session: SessionId,
    mut events: mpsc::Receiver<SessionEvent>,
    router: Arc<RequestRouter>,
    events_tx: broadcast::Sender<MultiplexerEvent>,
    registry: Weak<Mutex<Registry>>,
    retired_dropped: Arc<AtomicU64>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Frame(text) => {
                if router.route(&text).await == RouteOutcome::Malformed {
                    let _ = events_tx.send(MultiplexerEvent::ProtocolError {
                        family,
                        session,
                        message: format!("Malformed frame: {}", truncate(&text, 128)),
                    });
                }
                // closing a session waits for this loop, so release elsewhere
                if router.take_dead_targets() {
                    if let Some(registry) = registry.upgrade() {
                        let retired_dropped = Arc::clone(&retired_dropped);
                        tokio::spawn(async move {
                            let mut registry = registry.lock().await;
                            release_dead_targets(&mut registry, &retired_dropped).await;
                        });
                    }
                }
            }
            SessionEvent::ProtocolError(message) => {
                let _ = events_tx.send(MultiplexerEvent::ProtocolError {
                    family,
                    session,
                    message,
                });
            }
            SessionEvent::Lifecycle(transition) => {
                if transition.from == ConnectionState::Streaming {
                    // responses can never arrive on the next socket
                    router.fail_pending(WebSocketError::ConnectionLost);
                }
                match transition.to {
                    ConnectionState::Streaming => {
                        // awaiting acks here would block the frames carrying them
                        tokio::spawn(resubscribe(
                            family,
                            session,
                            Arc::clone(&router),
                            events_tx.clone(),
                        ));
                    }
                    ConnectionState::Exiting => {
                        let reason = transition
                            .reason
                            .clone()
                            .unwrap_or_else(|| "Session closed".to_string());
                        router.fail_pending(WebSocketError::SessionClosed);
                        router.close_handlers(&reason);
                    }
                    _ => {}
                }
                let _ = events_tx.send(MultiplexerEvent::Session { family, transition });
            }
            SessionEvent::Fatal { session, error } => {
                tracing::error!("{} ({}) closed permanently: {}", session, family, error);
                let _ = events_tx.send(MultiplexerEvent::Fatal {
                    family,
                    session,
                    error,
                });
            }
        }
    }
    tracing::debug!("Dispatch for {} finished", session);
}

async fn resubscribe(
    family: MarketFamily,
    session: SessionId,
    router: Arc<RequestRouter>,
    events_tx: broadcast::Sender<MultiplexerEvent>,
) {
    let keys = router.stream_keys();
    if keys.is_empty() {
        return;
    }

    let ack = match router.subscribe(&keys).await {
        Ok(pending) => pending.wait().await,
        Err(e) => Err(e),
    };
    match ack {
        Ok(_) => {
            tracing::info!("Resubscribed {} streams on {}", keys.len(), session);
            let _ = events_tx.send(MultiplexerEvent::Resubscribed {
                family,
                session,
                streams: keys.len(),
            });
        }
        Err(e) => tracing::warn!("Resubscribe on {} failed: {}", session, e),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
