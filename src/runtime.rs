//! Blocking facade over the async stack.
//!
//! [`ThreadedRuntime`] runs a current-thread tokio runtime on a dedicated OS
//! thread. Synchronous callers register callbacks or iterate messages; every
//! hand-off between the two sides goes through a bounded channel.
//!
//! Callbacks for one subscription run one at a time on a worker from tokio's
//! blocking pool; different subscriptions run concurrently. A panicking
//! callback is caught and reported on the error channel.
//!
//! The blocking methods must not be called from inside an async context.
//!
//! # Example
//!
//! ```ignore
//! let runtime = ThreadedRuntime::new(RuntimeConfig::default());
//! runtime.start()?;
//!
//! runtime.subscribe_callback(MarketFamily::Spot, "btcusdt@trade", |msg| {
//!     println!("{}", msg.data);
//! })?;
//!
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! runtime.stop()?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::network::MarketFamily;
use crate::websocket::depth::{OrderBookLevel, SnapshotSource};
use crate::websocket::error::{WebSocketError, WsResult};
use crate::websocket::keepalive::{KeepAliveConfig, KeepAliveSession, ListenKeyProvider};
use crate::websocket::multiplexer::{
    Multiplexer, MultiplexerConfig, MultiplexerEvent, SubscriptionHandle, SubscriptionId,
};
use crate::websocket::session::{SessionEvent, SessionId};
use crate::websocket::state::{
    CacheEvent, DepthCacheConfig, OrderBook, OrderBookCache, OrderBookReader,
};
use crate::websocket::transport::{Connector, TungsteniteConnector};
use crate::websocket::types::{StreamItem, StreamMessage};

/// Threaded runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub multiplexer: MultiplexerConfig,
    /// Queued messages per subscription before delivery applies backpressure
    pub queue_capacity: usize,
    /// Name of the runtime thread
    pub thread_name: String,
    /// Upper bound on waiting for in-flight callbacks during `stop`
    pub stop_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            multiplexer: MultiplexerConfig::default(),
            queue_capacity: 1024,
            thread_name: "binance-streams".to_string(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors reported on the runtime's error channel
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Callback for {stream} panicked: {message}")]
    CallbackPanicked {
        subscription: SubscriptionId,
        stream: String,
        message: String,
    },

    #[error("{session} ({family}) closed permanently: {error}")]
    Fatal {
        family: MarketFamily,
        session: SessionId,
        error: WebSocketError,
    },

    #[error("Protocol error on {session}: {message}")]
    Protocol { session: SessionId, message: String },

    #[error("Order book cache for {symbol}: {message}")]
    Cache { symbol: String, message: String },
}

struct Subscription {
    handle: SubscriptionHandle,
    /// Strong side of the delivery channel; dropping it ends the consumer
    tx: mpsc::Sender<StreamItem>,
    worker: Option<JoinHandle<()>>,
}

struct Running {
    handle: Handle,
    shutdown_tx: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
    multiplexer: Arc<Multiplexer>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    caches: Vec<OrderBookCache>,
    user_streams: Vec<UserStream>,
}

struct UserStream {
    session: KeepAliveSession,
    forward: JoinHandle<()>,
    worker: JoinHandle<()>,
}

/// Async stack on a dedicated thread with a blocking, callback-based API.
pub struct ThreadedRuntime {
    config: RuntimeConfig,
    connector: Arc<dyn Connector>,
    running: Mutex<Option<Running>>,
    errors_tx: mpsc::UnboundedSender<RuntimeError>,
    errors_rx: Mutex<mpsc::UnboundedReceiver<RuntimeError>>,
}

impl ThreadedRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_connector(config, Arc::new(TungsteniteConnector::default()))
    }

    pub fn with_connector(config: RuntimeConfig, connector: Arc<dyn Connector>) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            running: Mutex::new(None),
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start the runtime thread. Calling it again while running is a no-op.
    pub fn start(&self) -> WsResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(Duration::from_secs(1));
            })
            .map_err(|e| WebSocketError::Io(e.to_string()))?;

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(WebSocketError::Io(format!("Failed to build runtime: {}", e)));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(WebSocketError::RuntimeStopped);
            }
        };

        let multiplexer = Arc::new(Multiplexer::with_connector(
            self.config.multiplexer.clone(),
            Arc::clone(&self.connector),
        ));
        handle.spawn(forward_multiplexer_errors(
            multiplexer.events(),
            self.errors_tx.clone(),
        ));

        *running = Some(Running {
            handle,
            shutdown_tx,
            thread,
            multiplexer,
            subscriptions: HashMap::new(),
            caches: Vec::new(),
            user_streams: Vec::new(),
        });
        tracing::info!("Threaded runtime started");
        Ok(())
    }

    /// Graceful shutdown: cancel pending requests, close every session,
    /// drain in-flight callbacks, then join the runtime thread.
    pub fn stop(&self) -> WsResult<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        let Running {
            handle,
            shutdown_tx,
            thread,
            multiplexer,
            subscriptions,
            caches,
            user_streams,
        } = running;

        let stop_timeout = self.config.stop_timeout;
        let (done_tx, done_rx) = oneshot::channel();
        handle.spawn(async move {
            multiplexer.shutdown().await;

            for mut cache in caches {
                let _ = cache.close().await;
            }

            let mut workers = Vec::new();
            for (_, subscription) in subscriptions {
                drop(subscription.tx);
                workers.extend(subscription.worker);
            }
            for mut stream in user_streams {
                let _ = stream.session.close().await;
                stream.forward.abort();
                workers.push(stream.worker);
            }

            let drain = async {
                for worker in workers {
                    let _ = worker.await;
                }
            };
            if tokio::time::timeout(stop_timeout, drain).await.is_err() {
                tracing::warn!("Callbacks still running after {:?}", stop_timeout);
            }
            let _ = done_tx.send(());
        });

        let _ = done_rx.blocking_recv();
        let _ = shutdown_tx.send(());
        if thread.join().is_err() {
            tracing::error!("Runtime thread panicked");
        }
        tracing::info!("Threaded runtime stopped");
        Ok(())
    }

    fn context(&self) -> WsResult<(Handle, Arc<Multiplexer>)> {
        self.running
            .lock()
            .as_ref()
            .map(|running| (running.handle.clone(), Arc::clone(&running.multiplexer)))
            .ok_or(WebSocketError::RuntimeStopped)
    }

    /// Run `fut` on the runtime and block until it completes.
    fn run<F, T>(&self, handle: &Handle, fut: F) -> WsResult<T>
    where
        F: Future<Output = WsResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.blocking_recv()
            .map_err(|_| WebSocketError::RuntimeStopped)?
    }

    fn subscribe_with_channel(
        &self,
        family: MarketFamily,
        stream_key: &str,
    ) -> WsResult<(Handle, SubscriptionHandle, mpsc::Sender<StreamItem>, mpsc::Receiver<StreamItem>)>
    {
        let (handle, multiplexer) = self.context()?;
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let weak = tx.downgrade();
        let key = stream_key.to_string();
        let subscription = self.run(&handle, async move {
            multiplexer.subscribe(family, &key, weak).await
        })?;
        Ok((handle, subscription, tx, rx))
    }

    /// Deliver `stream_key` messages to `callback` on a worker thread.
    pub fn subscribe_callback<F>(
        &self,
        family: MarketFamily,
        stream_key: &str,
        callback: F,
    ) -> WsResult<SubscriptionId>
    where
        F: FnMut(StreamMessage) + Send + 'static,
    {
        let (handle, subscription, tx, rx) = self.subscribe_with_channel(family, stream_key)?;
        let id = subscription.id;
        let stream = subscription.stream_key.clone();
        let errors = self.errors_tx.clone();
        let worker = handle.spawn_blocking(move || run_callback(id, &stream, rx, callback, errors));

        self.register(Subscription {
            handle: subscription,
            tx,
            worker: Some(worker),
        })?;
        Ok(id)
    }

    /// Blocking iterator over `stream_key` messages. It ends when the
    /// subscription is removed, its session closes for good, or the runtime
    /// stops.
    pub fn subscribe_iter(&self, family: MarketFamily, stream_key: &str) -> WsResult<MessageIter> {
        let (handle, subscription, tx, rx) = self.subscribe_with_channel(family, stream_key)?;
        let id = subscription.id;
        self.register(Subscription {
            handle: subscription,
            tx,
            worker: None,
        })?;
        Ok(MessageIter { id, handle, rx })
    }

    fn register(&self, subscription: Subscription) -> WsResult<()> {
        let mut running = self.running.lock();
        match running.as_mut() {
            Some(running) => {
                running
                    .subscriptions
                    .insert(subscription.handle.id, subscription);
                Ok(())
            }
            None => Err(WebSocketError::RuntimeStopped),
        }
    }

    /// Remove a callback or iterator subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> WsResult<()> {
        let (handle, multiplexer) = self.context()?;
        let subscription = self
            .running
            .lock()
            .as_mut()
            .and_then(|running| running.subscriptions.remove(&id));
        let Some(subscription) = subscription else {
            return Err(WebSocketError::SubscriptionFailed(format!(
                "Unknown subscription {:?}",
                id
            )));
        };

        let Subscription { handle: sub, tx, .. } = subscription;
        drop(tx);
        self.run(&handle, async move { multiplexer.unsubscribe(sub).await })
    }

    /// Blocking request-style call on a session of `family`.
    pub fn request(
        &self,
        family: MarketFamily,
        method: &str,
        params: Option<Value>,
    ) -> WsResult<Value> {
        let (handle, multiplexer) = self.context()?;
        let method = method.to_string();
        self.run(&handle, async move {
            multiplexer.request(family, &method, params).await
        })
    }

    /// Start an order book cache; query it synchronously via the handle.
    pub fn start_depth_cache(
        &self,
        family: MarketFamily,
        symbol: &str,
        config: DepthCacheConfig,
        source: Arc<dyn SnapshotSource>,
    ) -> WsResult<DepthCacheHandle> {
        let (handle, multiplexer) = self.context()?;
        let symbol_owned = symbol.to_uppercase();
        let (cache, events) = self.run(&handle, {
            let symbol = symbol_owned.clone();
            async move { OrderBookCache::start(multiplexer, family, &symbol, config, source).await }
        })?;

        handle.spawn(forward_cache_errors(
            symbol_owned.clone(),
            events,
            self.errors_tx.clone(),
        ));
        let reader = cache.reader();

        let mut running = self.running.lock();
        match running.as_mut() {
            Some(running) => running.caches.push(cache),
            None => return Err(WebSocketError::RuntimeStopped),
        }

        Ok(DepthCacheHandle {
            family,
            symbol: symbol_owned,
            reader,
        })
    }

    /// Start a listen-key user data stream delivering to `callback`.
    pub fn start_user_stream<F>(
        &self,
        config: KeepAliveConfig,
        provider: Arc<dyn ListenKeyProvider>,
        callback: F,
    ) -> WsResult<()>
    where
        F: FnMut(StreamMessage) + Send + 'static,
    {
        let (handle, _) = self.context()?;
        let connector = Arc::clone(&self.connector);
        let family = config.family;
        let (session, events) = self.run(&handle, async move {
            Ok(KeepAliveSession::spawn(config, provider, connector))
        })?;

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let errors = self.errors_tx.clone();
        let forward = handle.spawn(forward_user_events(
            family,
            session.sender().id(),
            events,
            tx,
            errors.clone(),
        ));
        let worker = handle.spawn_blocking(move || {
            run_callback(SubscriptionId(0), "userData", rx, callback, errors)
        });

        let mut running = self.running.lock();
        match running.as_mut() {
            Some(running) => {
                running.user_streams.push(UserStream {
                    session,
                    forward,
                    worker,
                });
                Ok(())
            }
            None => Err(WebSocketError::RuntimeStopped),
        }
    }

    /// Next reported error, if any
    pub fn try_recv_error(&self) -> Option<RuntimeError> {
        self.errors_rx.lock().try_recv().ok()
    }

    /// All errors reported so far
    pub fn drain_errors(&self) -> Vec<RuntimeError> {
        let mut rx = self.errors_rx.lock();
        let mut errors = Vec::new();
        while let Ok(error) = rx.try_recv() {
            errors.push(error);
        }
        errors
    }

    /// Number of callback and iterator subscriptions
    pub fn subscription_count(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.subscriptions.len())
            .unwrap_or(0)
    }
}

impl Drop for ThreadedRuntime {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Blocking iterator returned by [`ThreadedRuntime::subscribe_iter`]
pub struct MessageIter {
    id: SubscriptionId,
    handle: Handle,
    rx: mpsc::Receiver<StreamItem>,
}

impl MessageIter {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait at most `timeout` for the next message.
    ///
    /// The wait is timed by the runtime thread. After `stop` the channel is
    /// already closed, so the runtime is never entered once it is gone.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<StreamMessage> {
        let item = match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(mpsc::error::TryRecvError::Disconnected) => None,
            Err(mpsc::error::TryRecvError::Empty) => {
                let rx = &mut self.rx;
                self.handle.block_on(async move {
                    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
                })
            }
        };
        match item? {
            StreamItem::Message(msg) => Some(msg),
            StreamItem::Closed { .. } => None,
        }
    }
}

impl Iterator for MessageIter {
    type Item = StreamMessage;

    fn next(&mut self) -> Option<StreamMessage> {
        match self.rx.blocking_recv()? {
            StreamItem::Message(msg) => Some(msg),
            StreamItem::Closed { .. } => None,
        }
    }
}

/// Synchronous view of a running order book cache
#[derive(Debug, Clone)]
pub struct DepthCacheHandle {
    family: MarketFamily,
    symbol: String,
    reader: OrderBookReader,
}

impl DepthCacheHandle {
    pub fn family(&self) -> MarketFamily {
        self.family
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Fails with `Resyncing` while the book is being rebuilt.
    pub fn order_book(&self, depth: Option<usize>) -> WsResult<OrderBook> {
        self.reader.order_book(depth)
    }

    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.reader.best_bid()
    }

    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.reader.best_ask()
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.reader.spread()
    }

    pub fn midpoint(&self) -> Option<Decimal> {
        self.reader.midpoint()
    }

    pub fn is_consistent(&self) -> bool {
        self.reader.is_consistent()
    }
}

/// Serial callback delivery for one subscription.
fn run_callback<F>(
    subscription: SubscriptionId,
    stream: &str,
    mut rx: mpsc::Receiver<StreamItem>,
    mut callback: F,
    errors: mpsc::UnboundedSender<RuntimeError>,
) where
    F: FnMut(StreamMessage),
{
    while let Some(item) = rx.blocking_recv() {
        let msg = match item {
            StreamItem::Message(msg) => msg,
            StreamItem::Closed { reason } => {
                tracing::debug!("{} closed: {}", stream, reason);
                break;
            }
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(msg))) {
            let message = panic_message(&panic);
            tracing::error!("Callback for {} panicked: {}", stream, message);
            let _ = errors.send(RuntimeError::CallbackPanicked {
                subscription,
                stream: stream.to_string(),
                message,
            });
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

async fn forward_multiplexer_errors(
    mut events: broadcast::Receiver<MultiplexerEvent>,
    errors: mpsc::UnboundedSender<RuntimeError>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Runtime missed {} multiplexer events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let error = match event {
            MultiplexerEvent::Fatal {
                family,
                session,
                error,
            } => RuntimeError::Fatal {
                family,
                session,
                error,
            },
            MultiplexerEvent::ProtocolError {
                session, message, ..
            } => RuntimeError::Protocol { session, message },
            _ => continue,
        };
        if errors.send(error).is_err() {
            break;
        }
    }
}

async fn forward_cache_errors(
    symbol: String,
    mut events: mpsc::Receiver<CacheEvent>,
    errors: mpsc::UnboundedSender<RuntimeError>,
) {
    while let Some(event) = events.recv().await {
        match event {
            CacheEvent::ProtocolError(message) => {
                let _ = errors.send(RuntimeError::Cache {
                    symbol: symbol.clone(),
                    message,
                });
            }
            CacheEvent::Resyncing { reason } => {
                tracing::debug!("{} resyncing: {}", symbol, reason);
            }
            CacheEvent::Closed { .. } => break,
            CacheEvent::Synced { .. } | CacheEvent::Updated { .. } => {}
        }
    }
}

async fn forward_user_events(
    family: MarketFamily,
    session: SessionId,
    mut events: mpsc::Receiver<SessionEvent>,
    tx: mpsc::Sender<StreamItem>,
    errors: mpsc::UnboundedSender<RuntimeError>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Frame(text) => match serde_json::from_str::<Value>(&text) {
                Ok(data) => {
                    let msg = StreamMessage {
                        stream: String::new(),
                        data,
                    };
                    if tx.send(StreamItem::Message(msg)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Unparseable user data frame: {}", e);
                    let _ = errors.send(RuntimeError::Protocol {
                        session,
                        message: format!("Unparseable user data frame: {}", e),
                    });
                }
            },
            SessionEvent::ProtocolError(message) => {
                tracing::warn!("User data protocol error: {}", message);
                let _ = errors.send(RuntimeError::Protocol { session, message });
            }
            SessionEvent::Fatal { session, error } => {
                let _ = errors.send(RuntimeError::Fatal {
                    family,
                    session,
                    error,
                });
            }
            SessionEvent::Lifecycle(_) => {}
        }
    }
}
