//! Request/response correlation and push-event routing for one session.
//!
//! Every request-style frame gets a fresh id and a [`PendingRequest`]; the
//! matching response resolves its waiter. Pushes are routed by stream key to
//! the delivery targets registered for that key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::websocket::error::{WebSocketError, WsResult};
use crate::websocket::session::SessionSender;
use crate::websocket::types::{InboundFrame, StreamItem, StreamMessage, WsRequest};

/// Default timeout for a correlated request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifier of one registered delivery target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// An outstanding request awaiting its response
#[derive(Debug)]
pub struct PendingRequest {
    pub created_at: Instant,
    waiter: oneshot::Sender<WsResult<Value>>,
}

/// Waiter returned by [`RequestRouter::send`]
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    timeout: Duration,
    rx: oneshot::Receiver<WsResult<Value>>,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
}

impl PendingResponse {
    /// Correlation id of the request
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response. Times out with `RequestTimeout`; never retried.
    pub async fn wait(self) -> WsResult<Value> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WebSocketError::Cancelled),
            Err(_) => {
                self.pending.lock().remove(&self.id);
                tracing::warn!("Request {} timed out after {:?}", self.id, self.timeout);
                Err(WebSocketError::RequestTimeout { id: self.id })
            }
        }
    }
}

/// What `route` did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Resolved a pending request
    Resolved(u64),
    /// Delivered to this many targets
    Delivered(usize),
    /// Nobody was interested; counted
    Dropped,
    /// Frame was not valid JSON
    Malformed,
}

type Targets = Vec<(SubscriptionId, mpsc::WeakSender<StreamItem>)>;

/// Correlates requests with responses and routes pushes by stream key.
pub struct RequestRouter {
    sender: SessionSender,
    next_id: AtomicU64,
    request_timeout: Duration,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    handlers: Mutex<HashMap<String, Targets>>,
    unkeyed: Mutex<Option<mpsc::WeakSender<StreamItem>>>,
    dropped: AtomicU64,
    /// Set when a push found a target whose receiver is gone
    dead_targets: AtomicBool,
}

impl RequestRouter {
    pub fn new(sender: SessionSender, request_timeout: Duration) -> Self {
        Self {
            sender,
            next_id: AtomicU64::new(1),
            request_timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: Mutex::new(HashMap::new()),
            unkeyed: Mutex::new(None),
            dropped: AtomicU64::new(0),
            dead_targets: AtomicBool::new(false),
        }
    }

    pub fn sender(&self) -> &SessionSender {
        &self.sender
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and return its waiter.
    pub async fn send(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> WsResult<PendingResponse> {
        let id = self.next_id();
        self.send_request(WsRequest::new(method, params, id)).await
    }

    /// `SUBSCRIBE` for the given keys
    pub async fn subscribe(&self, stream_keys: &[String]) -> WsResult<PendingResponse> {
        let id = self.next_id();
        self.send_request(WsRequest::subscribe(stream_keys, id)).await
    }

    /// `UNSUBSCRIBE` for the given keys
    pub async fn unsubscribe(&self, stream_keys: &[String]) -> WsResult<PendingResponse> {
        let id = self.next_id();
        self.send_request(WsRequest::unsubscribe(stream_keys, id))
            .await
    }

    async fn send_request(&self, request: WsRequest) -> WsResult<PendingResponse> {
        let id = request.id;
        let text = serde_json::to_string(&request)?;

        let (waiter, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                waiter,
            },
        );

        if let Err(e) = self.sender.send_text(text).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        tracing::debug!("Sent {} request {}", request.method, id);

        Ok(PendingResponse {
            id,
            timeout: self.request_timeout,
            rx,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Register a delivery target for a stream key.
    pub fn add_handler(
        &self,
        stream_key: &str,
        id: SubscriptionId,
        target: mpsc::WeakSender<StreamItem>,
    ) {
        self.handlers
            .lock()
            .entry(stream_key.to_string())
            .or_default()
            .push((id, target));
    }

    /// Remove a delivery target. Returns `true` if it was the key's last one.
    pub fn remove_handler(&self, stream_key: &str, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(targets) = handlers.get_mut(stream_key) else {
            return false;
        };
        targets.retain(|(target_id, _)| *target_id != id);
        if targets.is_empty() {
            handlers.remove(stream_key);
            true
        } else {
            false
        }
    }

    /// Route events without a stream field (raw sockets) to this target.
    pub fn set_unkeyed_handler(&self, target: mpsc::WeakSender<StreamItem>) {
        *self.unkeyed.lock() = Some(target);
    }

    /// Stream keys with at least one target
    pub fn stream_keys(&self) -> Vec<String> {
        self.handlers.lock().keys().cloned().collect()
    }

    pub fn has_stream(&self, stream_key: &str) -> bool {
        self.handlers.lock().contains_key(stream_key)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().values().map(Vec::len).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Frames that matched no request and no live subscription
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Route one inbound text frame.
    ///
    /// Delivery awaits channel capacity, so a slow subscriber applies
    /// backpressure instead of losing frames.
    pub async fn route(&self, text: &str) -> RouteOutcome {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Unparseable frame: {}", e);
                return RouteOutcome::Malformed;
            }
        };

        match frame {
            InboundFrame::Response { id, result } => {
                let pending = self.pending.lock().remove(&id);
                match pending {
                    Some(request) => {
                        tracing::debug!(
                            "Response {} after {:?}",
                            id,
                            request.created_at.elapsed()
                        );
                        let _ = request.waiter.send(result.map_err(WebSocketError::from));
                        RouteOutcome::Resolved(id)
                    }
                    None => self.drop_frame(format_args!("response for unknown id {}", id)),
                }
            }
            InboundFrame::UnknownResponse { raw_id } => {
                self.drop_frame(format_args!("response with foreign id {}", raw_id))
            }
            InboundFrame::Push {
                stream: Some(stream),
                data,
            } => {
                let targets = self.live_targets(&stream);
                if targets.is_empty() {
                    return self.drop_frame(format_args!("push for inactive stream {}", stream));
                }
                let message = StreamMessage { stream, data };
                let mut delivered = 0;
                for target in targets {
                    if target.send(StreamItem::Message(message.clone())).await.is_ok() {
                        delivered += 1;
                    }
                }
                if delivered == 0 {
                    return self.drop_frame(format_args!("push for closed stream {}", message.stream));
                }
                RouteOutcome::Delivered(delivered)
            }
            InboundFrame::Push { stream: None, data } => {
                let target = self.unkeyed.lock().as_ref().and_then(|t| t.upgrade());
                let Some(target) = target else {
                    return self.drop_frame(format_args!("push without stream key"));
                };
                let message = StreamMessage {
                    stream: String::new(),
                    data,
                };
                match target.send(StreamItem::Message(message)).await {
                    Ok(()) => RouteOutcome::Delivered(1),
                    Err(_) => self.drop_frame(format_args!("push for closed raw stream")),
                }
            }
        }
    }

    /// Upgrade the weak targets for a key. The lock is released before any await.
    fn live_targets(&self, stream_key: &str) -> Vec<mpsc::Sender<StreamItem>> {
        let handlers = self.handlers.lock();
        let Some(targets) = handlers.get(stream_key) else {
            return Vec::new();
        };
        let live: Vec<_> = targets.iter().filter_map(|(_, t)| t.upgrade()).collect();
        if live.len() < targets.len() {
            self.dead_targets.store(true, Ordering::Release);
        }
        live
    }

    /// Whether a push has seen a dead target since the last call.
    pub fn take_dead_targets(&self) -> bool {
        self.dead_targets.swap(false, Ordering::AcqRel)
    }

    /// Remove targets whose receiver was dropped without unsubscribing.
    ///
    /// Returns the removed subscriptions and the keys left with no target.
    pub fn prune_dead_targets(&self) -> (Vec<SubscriptionId>, Vec<String>) {
        let mut removed = Vec::new();
        let mut emptied = Vec::new();
        self.handlers.lock().retain(|stream_key, targets| {
            targets.retain(|(id, target)| {
                let alive = target.strong_count() > 0;
                if !alive {
                    removed.push(*id);
                }
                alive
            });
            if targets.is_empty() {
                emptied.push(stream_key.clone());
                false
            } else {
                true
            }
        });
        (removed, emptied)
    }

    fn drop_frame(&self, what: std::fmt::Arguments<'_>) -> RouteOutcome {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("Dropped frame ({}), {} dropped so far", what, total);
        RouteOutcome::Dropped
    }

    /// Resolve every outstanding waiter with `err`.
    pub fn fail_pending(&self, err: WebSocketError) -> usize {
        let drained: Vec<PendingRequest> =
            self.pending.lock().drain().map(|(_, request)| request).collect();
        let count = drained.len();
        for request in drained {
            let _ = request.waiter.send(Err(err.clone()));
        }
        if count > 0 {
            tracing::info!("Failed {} pending requests: {}", count, err);
        }
        count
    }

    /// Tell every delivery target its stream is permanently closed.
    pub fn close_handlers(&self, reason: &str) {
        let targets: Vec<mpsc::WeakSender<StreamItem>> = {
            let mut handlers = self.handlers.lock();
            let targets = handlers
                .drain()
                .flat_map(|(_, targets)| targets.into_iter().map(|(_, t)| t))
                .collect();
            targets
        };
        let unkeyed = self.unkeyed.lock().take();

        for target in targets.into_iter().chain(unkeyed) {
            if let Some(target) = target.upgrade() {
                let _ = target.try_send(StreamItem::Closed {
                    reason: reason.to_string(),
                });
            }
        }
    }
}
