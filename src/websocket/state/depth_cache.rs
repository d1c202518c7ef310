//! Local order book cache.
//!
//! [`CacheState`] is the synchronous core: it buffers diffs while a snapshot
//! is outstanding, bridges the snapshot to the diff stream, and applies diffs
//! only while they are provably contiguous. [`OrderBookCache`] drives it from
//! a multiplexed depth subscription and a [`SnapshotSource`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::network::MarketFamily;
use crate::websocket::depth::{
    DepthUpdate, OrderBookDiff, OrderBookLevel, OrderBookSnapshot, SnapshotSource,
};
use crate::websocket::error::{WebSocketError, WsResult};
use crate::websocket::multiplexer::{Multiplexer, SubscriptionHandle, SubscriptionStream};
use crate::websocket::streams::depth_stream;
use crate::websocket::types::StreamItem;

/// Diffs kept while waiting for a snapshot. Oldest are dropped beyond this.
const MAX_BUFFERED_DIFFS: usize = 10_000;

// ============================================================================
// CONTIGUITY POLICY
// ============================================================================

/// How a market family proves that a diff follows the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContiguityPolicy {
    /// Spot: bridge with `U <= L + 1 <= u`, then `U == last + 1`
    Range,
    /// Futures: bridge with `U <= L <= u` or `pu == L`, then `pu == last`
    PreviousId,
    /// Options: every event is a complete book, no REST snapshot
    FullRefresh,
}

impl ContiguityPolicy {
    pub fn for_family(family: MarketFamily) -> Self {
        match family {
            MarketFamily::Spot => ContiguityPolicy::Range,
            MarketFamily::UsdFutures | MarketFamily::CoinFutures => ContiguityPolicy::PreviousId,
            MarketFamily::Options => ContiguityPolicy::FullRefresh,
        }
    }

    pub fn needs_snapshot(&self) -> bool {
        !matches!(self, ContiguityPolicy::FullRefresh)
    }

    /// First diff after a snapshot with `lastUpdateId == snapshot_id`
    fn bridges(&self, diff: &OrderBookDiff, snapshot_id: u64) -> bool {
        match self {
            ContiguityPolicy::Range => diff.covers(snapshot_id + 1),
            ContiguityPolicy::PreviousId => {
                diff.covers(snapshot_id)
                    || diff.covers(snapshot_id + 1)
                    || diff.previous_update_id == Some(snapshot_id)
            }
            ContiguityPolicy::FullRefresh => true,
        }
    }

    /// Any later diff, given the last applied `lastUpdateId`
    fn follows(&self, diff: &OrderBookDiff, last_applied: u64) -> bool {
        match self {
            ContiguityPolicy::Range => diff.first_update_id == last_applied + 1,
            ContiguityPolicy::PreviousId => match diff.previous_update_id {
                Some(pu) => pu == last_applied,
                None => diff.first_update_id == last_applied + 1,
            },
            ContiguityPolicy::FullRefresh => true,
        }
    }
}

// ============================================================================
// CACHE STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Collecting diffs until a snapshot arrives
    Buffering,
    /// Snapshot applied with nothing buffered; next diff must bridge
    AwaitingBridge,
    /// Applying diffs in order
    Live,
}

/// Result of feeding one diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Held until the snapshot arrives
    Buffered,
    /// Merged into the book
    Applied { last_update_id: u64 },
    /// Already covered by the book
    Discarded,
    /// Gap detected; the book is inconsistent and a new snapshot is needed
    ResyncRequired { expected: u64, received: u64 },
}

/// Result of applying a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Book is consistent from `last_update_id`
    Synced { last_update_id: u64, applied: usize },
    /// Snapshot could not be bridged to the buffered diffs
    ResyncRequired { reason: String },
    /// Not waiting for a snapshot
    Ignored,
}

/// Read-only copy of a book
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBook {
    pub symbol: String,
    pub last_update_id: u64,
    /// Descending by price
    pub bids: Vec<OrderBookLevel>,
    /// Ascending by price
    pub asks: Vec<OrderBookLevel>,
}

/// Order book for one symbol plus its synchronization state.
#[derive(Debug, Clone)]
pub struct CacheState {
    symbol: String,
    policy: ContiguityPolicy,
    /// price -> quantity
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: Option<u64>,
    buffer: Vec<OrderBookDiff>,
    phase: Phase,
}

impl CacheState {
    pub fn new(symbol: impl Into<String>, policy: ContiguityPolicy) -> Self {
        Self {
            symbol: symbol.into(),
            policy,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: None,
            buffer: Vec::new(),
            phase: Phase::Buffering,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn policy(&self) -> ContiguityPolicy {
        self.policy
    }

    /// Whether the book can be read
    pub fn is_consistent(&self) -> bool {
        self.phase != Phase::Buffering
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.last_update_id
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Start (re)initialization: the book becomes unreadable and diffs are
    /// buffered until the next snapshot.
    pub fn begin_sync(&mut self) {
        self.phase = Phase::Buffering;
        self.buffer.clear();
    }

    /// Feed one diff from the stream.
    pub fn on_diff(&mut self, diff: OrderBookDiff) -> DiffOutcome {
        if self.policy == ContiguityPolicy::FullRefresh {
            return self.replace_book(diff);
        }

        match self.phase {
            Phase::Buffering => {
                if self.buffer.len() >= MAX_BUFFERED_DIFFS {
                    self.buffer.remove(0);
                }
                self.buffer.push(diff);
                DiffOutcome::Buffered
            }
            Phase::AwaitingBridge | Phase::Live => {
                let last = self.last_update_id.unwrap_or(0);
                if diff.last_update_id <= last {
                    return DiffOutcome::Discarded;
                }

                let contiguous = if self.phase == Phase::AwaitingBridge {
                    self.policy.bridges(&diff, last)
                } else {
                    self.policy.follows(&diff, last)
                };
                if contiguous {
                    self.apply(&diff);
                    self.phase = Phase::Live;
                    return DiffOutcome::Applied {
                        last_update_id: diff.last_update_id,
                    };
                }

                let received = diff.first_update_id;
                tracing::warn!(
                    "{} depth gap: expected {}, received {}",
                    self.symbol,
                    last + 1,
                    received
                );
                self.restart_with(vec![diff]);
                DiffOutcome::ResyncRequired {
                    expected: last + 1,
                    received,
                }
            }
        }
    }

    /// Apply a REST snapshot and bridge it to the buffered diffs.
    pub fn on_snapshot(&mut self, snapshot: OrderBookSnapshot) -> SnapshotOutcome {
        if self.phase != Phase::Buffering {
            return SnapshotOutcome::Ignored;
        }

        let snapshot_id = snapshot.last_update_id;
        self.load(snapshot);

        let mut buffered = std::mem::take(&mut self.buffer);
        buffered.sort_by_key(|diff| diff.last_update_id);
        buffered.retain(|diff| diff.last_update_id > snapshot_id);

        let mut diffs = buffered.into_iter();
        let Some(first) = diffs.next() else {
            self.phase = Phase::AwaitingBridge;
            return SnapshotOutcome::Synced {
                last_update_id: snapshot_id,
                applied: 0,
            };
        };

        if !self.policy.bridges(&first, snapshot_id) {
            let reason = format!(
                "snapshot {} does not bridge to diff {}..={}",
                snapshot_id, first.first_update_id, first.last_update_id
            );
            self.restart_with(std::iter::once(first).chain(diffs).collect());
            return SnapshotOutcome::ResyncRequired { reason };
        }

        self.apply(&first);
        let mut applied = 1;
        let mut last = first.last_update_id;

        while let Some(diff) = diffs.next() {
            if diff.last_update_id <= last {
                continue;
            }
            if !self.policy.follows(&diff, last) {
                let reason = format!(
                    "buffered gap: expected {}, received {}",
                    last + 1,
                    diff.first_update_id
                );
                self.restart_with(std::iter::once(diff).chain(diffs).collect());
                return SnapshotOutcome::ResyncRequired { reason };
            }
            self.apply(&diff);
            last = diff.last_update_id;
            applied += 1;
        }

        self.phase = Phase::Live;
        SnapshotOutcome::Synced {
            last_update_id: last,
            applied,
        }
    }

    fn restart_with(&mut self, buffer: Vec<OrderBookDiff>) {
        self.phase = Phase::Buffering;
        self.buffer = buffer;
    }

    fn load(&mut self, snapshot: OrderBookSnapshot) {
        self.bids.clear();
        self.asks.clear();
        for level in snapshot.bids.iter().filter(|l| !l.is_removal()) {
            self.bids.insert(level.price, level.quantity);
        }
        for level in snapshot.asks.iter().filter(|l| !l.is_removal()) {
            self.asks.insert(level.price, level.quantity);
        }
        self.last_update_id = Some(snapshot.last_update_id);
    }

    fn replace_book(&mut self, diff: OrderBookDiff) -> DiffOutcome {
        if let Some(last) = self.last_update_id {
            if self.phase == Phase::Live && diff.last_update_id < last {
                return DiffOutcome::Discarded;
            }
        }
        let last_update_id = diff.last_update_id;
        self.load(OrderBookSnapshot {
            last_update_id,
            bids: diff.bids,
            asks: diff.asks,
        });
        self.phase = Phase::Live;
        DiffOutcome::Applied { last_update_id }
    }

    fn apply(&mut self, diff: &OrderBookDiff) {
        for level in &diff.bids {
            if level.is_removal() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level.quantity);
            }
        }
        for level in &diff.asks {
            if level.is_removal() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level.quantity);
            }
        }
        self.last_update_id = Some(diff.last_update_id);
    }

    fn resyncing(&self) -> WebSocketError {
        WebSocketError::Resyncing {
            symbol: self.symbol.clone(),
        }
    }

    /// Copy of the top `depth` levels per side (all levels if `None`).
    pub fn order_book(&self, depth: Option<usize>) -> WsResult<OrderBook> {
        if !self.is_consistent() {
            return Err(self.resyncing());
        }
        let depth = depth.unwrap_or(usize::MAX);
        Ok(OrderBook {
            symbol: self.symbol.clone(),
            last_update_id: self.last_update_id.unwrap_or(0),
            bids: self
                .bids
                .iter()
                .rev()
                .take(depth)
                .map(|(&price, &quantity)| OrderBookLevel { price, quantity })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(&price, &quantity)| OrderBookLevel { price, quantity })
                .collect(),
        })
    }

    /// Get best bid
    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        if !self.is_consistent() {
            return None;
        }
        self.bids
            .iter()
            .next_back()
            .map(|(&price, &quantity)| OrderBookLevel { price, quantity })
    }

    /// Get best ask
    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        if !self.is_consistent() {
            return None;
        }
        self.asks
            .iter()
            .next()
            .map(|(&price, &quantity)| OrderBookLevel { price, quantity })
    }

    /// Get spread (best_ask - best_bid)
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Get midpoint price
    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }
}

// ============================================================================
// ASYNC DRIVER
// ============================================================================

/// Order book cache configuration
#[derive(Debug, Clone)]
pub struct DepthCacheConfig {
    /// Diff stream update speed (ms)
    pub update_speed_ms: u64,
    /// Levels requested from the snapshot endpoint
    pub snapshot_limit: u32,
    /// Force a fresh snapshot on this interval
    pub refresh_interval: Option<Duration>,
    /// Wait before retrying a failed snapshot fetch (ms)
    pub snapshot_retry_delay_ms: u64,
    /// Capacity of the depth subscription channel
    pub channel_capacity: usize,
    /// Capacity of the cache event channel
    pub event_capacity: usize,
}

impl Default for DepthCacheConfig {
    fn default() -> Self {
        Self {
            update_speed_ms: 100,
            snapshot_limit: 1000,
            refresh_interval: None,
            snapshot_retry_delay_ms: 1000,
            channel_capacity: 1000,
            event_capacity: 256,
        }
    }
}

/// Notifications from a running cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Synced { last_update_id: u64 },
    Updated { last_update_id: u64 },
    Resyncing { reason: String },
    ProtocolError(String),
    Closed { reason: String },
}

/// Cloneable read handle on a cache's state
#[derive(Debug, Clone)]
pub struct OrderBookReader {
    state: Arc<RwLock<CacheState>>,
}

impl OrderBookReader {
    pub fn order_book(&self, depth: Option<usize>) -> WsResult<OrderBook> {
        self.state.read().order_book(depth)
    }

    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.state.read().best_bid()
    }

    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.state.read().best_ask()
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.state.read().spread()
    }

    pub fn midpoint(&self) -> Option<Decimal> {
        self.state.read().midpoint()
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.state.read().last_update_id()
    }

    pub fn is_consistent(&self) -> bool {
        self.state.read().is_consistent()
    }
}

/// A running order book cache for one symbol.
pub struct OrderBookCache {
    family: MarketFamily,
    symbol: String,
    reader: OrderBookReader,
    multiplexer: Arc<Multiplexer>,
    subscription: Option<SubscriptionHandle>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl OrderBookCache {
    /// Subscribe to the symbol's depth stream and start synchronizing.
    pub async fn start(
        multiplexer: Arc<Multiplexer>,
        family: MarketFamily,
        symbol: &str,
        config: DepthCacheConfig,
        source: Arc<dyn SnapshotSource>,
    ) -> WsResult<(Self, mpsc::Receiver<CacheEvent>)> {
        let policy = ContiguityPolicy::for_family(family);
        let state = Arc::new(RwLock::new(CacheState::new(symbol.to_uppercase(), policy)));

        let key = depth_stream(family, symbol, config.update_speed_ms);
        let (subscription, stream) = multiplexer
            .subscribe_channel(family, &key, config.channel_capacity)
            .await?;

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = CacheTask {
            family,
            symbol: symbol.to_uppercase(),
            config,
            state: Arc::clone(&state),
            source,
            event_tx,
            generation: 0,
        };
        let handle = tokio::spawn(task.run(stream, shutdown_rx));
        tracing::info!("Started {} order book cache for {}", family, symbol);

        Ok((
            Self {
                family,
                symbol: symbol.to_uppercase(),
                reader: OrderBookReader { state },
                multiplexer,
                subscription: Some(subscription),
                shutdown_tx: Some(shutdown_tx),
                task_handle: Some(handle),
            },
            event_rx,
        ))
    }

    pub fn family(&self) -> MarketFamily {
        self.family
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn reader(&self) -> OrderBookReader {
        self.reader.clone()
    }

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

    /// Stop the cache and release its subscription. An in-flight snapshot
    /// fetch is left to finish and its result is discarded.
    pub async fn close(&mut self) -> WsResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
        if let Some(subscription) = self.subscription.take() {
            self.multiplexer.unsubscribe(subscription).await?;
        }
        Ok(())
    }
}

impl Drop for OrderBookCache {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

type SnapshotResult = (u64, WsResult<OrderBookSnapshot>);

struct CacheTask {
    family: MarketFamily,
    symbol: String,
    config: DepthCacheConfig,
    state: Arc<RwLock<CacheState>>,
    source: Arc<dyn SnapshotSource>,
    event_tx: mpsc::Sender<CacheEvent>,
    /// Bumped on every resync; older snapshot results are ignored
    generation: u64,
}

impl CacheTask {
    async fn run(mut self, mut stream: SubscriptionStream, mut shutdown_rx: oneshot::Receiver<()>) {
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<SnapshotResult>(4);
        let needs_snapshot = self.state.read().policy().needs_snapshot();

        if needs_snapshot {
            self.fetch_snapshot(&snapshot_tx, Duration::ZERO);
        }

        let refresh_period = self.config.refresh_interval.unwrap_or(Duration::from_secs(86400));
        let mut refresh = tokio::time::interval(refresh_period);
        refresh.reset();
        let refresh_enabled = self.config.refresh_interval.is_some() && needs_snapshot;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    self.emit(CacheEvent::Closed { reason: "Cache closed".to_string() });
                    break;
                }

                item = stream.next() => {
                    match item {
                        Some(StreamItem::Message(msg)) => {
                            match msg.parse::<DepthUpdate>() {
                                Ok(update) => self.on_update(update, &snapshot_tx),
                                Err(e) => {
                                    tracing::warn!("{} bad depth event: {}", self.symbol, e);
                                    self.emit(CacheEvent::ProtocolError(e.to_string()));
                                }
                            }
                        }
                        Some(StreamItem::Closed { reason }) => {
                            tracing::warn!("{} depth stream closed: {}", self.symbol, reason);
                            self.emit(CacheEvent::Closed { reason });
                            break;
                        }
                        None => {
                            self.emit(CacheEvent::Closed { reason: "Depth stream ended".to_string() });
                            break;
                        }
                    }
                }

                Some((generation, result)) = snapshot_rx.recv() => {
                    if generation == self.generation {
                        self.on_snapshot(result, &snapshot_tx);
                    }
                }

                _ = refresh.tick(), if refresh_enabled => {
                    tracing::info!("{} periodic order book refresh", self.symbol);
                    self.state.write().begin_sync();
                    self.emit(CacheEvent::Resyncing { reason: "Periodic refresh".to_string() });
                    self.fetch_snapshot(&snapshot_tx, Duration::ZERO);
                }
            }
        }
    }

    fn on_update(&mut self, update: DepthUpdate, snapshot_tx: &mpsc::Sender<SnapshotResult>) {
        let outcome = self.state.write().on_diff(update.into());
        match outcome {
            DiffOutcome::Applied { last_update_id } => {
                self.emit(CacheEvent::Updated { last_update_id });
            }
            DiffOutcome::ResyncRequired { expected, received } => {
                let reason = WebSocketError::SequenceGap { expected, received }.to_string();
                self.emit(CacheEvent::Resyncing { reason });
                self.fetch_snapshot(snapshot_tx, Duration::ZERO);
            }
            DiffOutcome::Buffered | DiffOutcome::Discarded => {}
        }
    }

    fn on_snapshot(
        &mut self,
        result: WsResult<OrderBookSnapshot>,
        snapshot_tx: &mpsc::Sender<SnapshotResult>,
    ) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("{} snapshot fetch failed: {}", self.symbol, e);
                let delay = Duration::from_millis(self.config.snapshot_retry_delay_ms);
                self.fetch_snapshot(snapshot_tx, delay);
                return;
            }
        };

        let outcome = self.state.write().on_snapshot(snapshot);
        match outcome {
            SnapshotOutcome::Synced { last_update_id, applied } => {
                tracing::info!(
                    "{} order book synced at {} ({} buffered diffs applied)",
                    self.symbol,
                    last_update_id,
                    applied
                );
                self.emit(CacheEvent::Synced { last_update_id });
            }
            SnapshotOutcome::ResyncRequired { reason } => {
                tracing::warn!("{} resync: {}", self.symbol, reason);
                self.emit(CacheEvent::Resyncing { reason });
                self.fetch_snapshot(snapshot_tx, Duration::ZERO);
            }
            SnapshotOutcome::Ignored => {}
        }
    }

    /// Start a snapshot fetch in the background. Supersedes any fetch
    /// already in flight.
    fn fetch_snapshot(&mut self, snapshot_tx: &mpsc::Sender<SnapshotResult>, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let source = Arc::clone(&self.source);
        let family = self.family;
        let symbol = self.symbol.clone();
        let limit = self.config.snapshot_limit;
        let tx = snapshot_tx.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = source.fetch(family, &symbol, limit).await;
            // receiver is gone once the cache is torn down
            let _ = tx.send((generation, result)).await;
        });
    }

    fn emit(&self, event: CacheEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            tracing::debug!("{} cache event channel full, skipped {:?}", self.symbol, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn level(price: &str, qty: &str) -> OrderBookLevel {
        OrderBookLevel::new(d(price), d(qty))
    }

    fn snapshot(last_update_id: u64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            last_update_id,
            bids: vec![level("100", "1"), level("99", "2")],
            asks: vec![level("101", "1"), level("102", "3")],
        }
    }

    fn diff(first: u64, last: u64) -> OrderBookDiff {
        OrderBookDiff {
            first_update_id: first,
            last_update_id: last,
            previous_update_id: None,
            bids: vec![],
            asks: vec![],
        }
    }

    fn futures_diff(first: u64, last: u64, prev: u64) -> OrderBookDiff {
        OrderBookDiff {
            previous_update_id: Some(prev),
            ..diff(first, last)
        }
    }

    #[test]
    fn test_bridging_diff_is_applied() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        assert_eq!(state.on_diff(diff(995, 1005)), DiffOutcome::Buffered);

        let outcome = state.on_snapshot(snapshot(1000));
        assert_eq!(
            outcome,
            SnapshotOutcome::Synced {
                last_update_id: 1005,
                applied: 1
            }
        );
        assert_eq!(state.last_update_id(), Some(1005));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_gap_after_snapshot_requires_resync() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        state.on_diff(diff(1010, 1015));

        let outcome = state.on_snapshot(snapshot(1000));
        assert!(matches!(outcome, SnapshotOutcome::ResyncRequired { .. }));
        assert!(!state.is_consistent());
        assert!(matches!(
            state.order_book(None),
            Err(WebSocketError::Resyncing { .. })
        ));
        // the unbridged diff waits for the next snapshot
        assert_eq!(state.buffered_len(), 1);

        let outcome = state.on_snapshot(snapshot(1012));
        assert_eq!(
            outcome,
            SnapshotOutcome::Synced {
                last_update_id: 1015,
                applied: 1
            }
        );
    }

    #[test]
    fn test_stale_buffered_diffs_are_discarded() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        let mut stale = diff(990, 999);
        stale.bids = vec![level("50", "5")];
        state.on_diff(stale);
        state.on_diff(diff(1000, 1000));
        state.on_diff(diff(1001, 1003));

        let outcome = state.on_snapshot(snapshot(1000));
        assert_eq!(
            outcome,
            SnapshotOutcome::Synced {
                last_update_id: 1003,
                applied: 1
            }
        );
        let book = state.order_book(None).unwrap();
        assert!(book.bids.iter().all(|l| l.price != d("50")));
    }

    #[test]
    fn test_buffered_diffs_are_sorted() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        state.on_diff(diff(1004, 1006));
        state.on_diff(diff(1001, 1003));

        let outcome = state.on_snapshot(snapshot(1000));
        assert_eq!(
            outcome,
            SnapshotOutcome::Synced {
                last_update_id: 1006,
                applied: 2
            }
        );
    }

    #[test]
    fn test_live_gap_restarts_buffering() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        state.on_diff(diff(999, 1001));
        state.on_snapshot(snapshot(1000));

        assert_eq!(
            state.on_diff(diff(1002, 1004)),
            DiffOutcome::Applied { last_update_id: 1004 }
        );
        assert_eq!(
            state.on_diff(diff(1010, 1012)),
            DiffOutcome::ResyncRequired {
                expected: 1005,
                received: 1010
            }
        );
        assert!(!state.is_consistent());
        assert_eq!(state.on_diff(diff(1013, 1014)), DiffOutcome::Buffered);
    }

    #[test]
    fn test_duplicate_diff_is_idempotent() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        state.on_snapshot(snapshot(1000));

        let mut update = diff(1001, 1002);
        update.bids = vec![level("100", "7")];
        assert_eq!(
            state.on_diff(update.clone()),
            DiffOutcome::Applied { last_update_id: 1002 }
        );
        assert_eq!(state.on_diff(update), DiffOutcome::Discarded);
        assert_eq!(state.on_diff(diff(900, 950)), DiffOutcome::Discarded);
        assert_eq!(state.best_bid(), Some(level("100", "7")));
    }

    #[test]
    fn test_empty_buffer_still_requires_bridge() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        let outcome = state.on_snapshot(snapshot(1000));
        assert_eq!(
            outcome,
            SnapshotOutcome::Synced {
                last_update_id: 1000,
                applied: 0
            }
        );
        assert!(state.is_consistent());

        assert!(matches!(
            state.on_diff(diff(1005, 1008)),
            DiffOutcome::ResyncRequired { .. }
        ));
    }

    #[test]
    fn test_previous_id_policy() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::PreviousId);
        state.begin_sync();
        state.on_diff(futures_diff(995, 1005, 990));
        state.on_snapshot(snapshot(1000));
        assert_eq!(state.last_update_id(), Some(1005));

        // futures ids are not consecutive; pu carries the chain
        assert_eq!(
            state.on_diff(futures_diff(1020, 1030, 1005)),
            DiffOutcome::Applied { last_update_id: 1030 }
        );
        assert!(matches!(
            state.on_diff(futures_diff(1040, 1050, 1035)),
            DiffOutcome::ResyncRequired { .. }
        ));
    }

    #[test]
    fn test_zero_quantity_removes_level() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        state.on_snapshot(snapshot(10));

        let mut update = diff(11, 11);
        update.bids = vec![level("100", "0"), level("99.5", "4")];
        update.asks = vec![level("100.5", "1")];
        state.on_diff(update);

        let book = state.order_book(None).unwrap();
        assert_eq!(book.bids, vec![level("99.5", "4"), level("99", "2")]);
        assert_eq!(book.asks[0], level("100.5", "1"));
        assert_eq!(state.spread(), Some(d("1")));
        assert_eq!(state.midpoint(), Some(d("100")));
    }

    #[test]
    fn test_order_book_depth() {
        let mut state = CacheState::new("BTCUSDT", ContiguityPolicy::Range);
        state.begin_sync();
        state.on_snapshot(snapshot(10));

        let book = state.order_book(Some(1)).unwrap();
        assert_eq!(book.bids, vec![level("100", "1")]);
        assert_eq!(book.asks, vec![level("101", "1")]);
        assert_eq!(book.last_update_id, 10);
    }

    #[test]
    fn test_full_refresh_replaces_book() {
        let mut state = CacheState::new("BTC-250328-90000-C", ContiguityPolicy::FullRefresh);
        assert!(!state.is_consistent());

        let mut update = diff(5, 5);
        update.bids = vec![level("0.1", "2")];
        update.asks = vec![level("0.2", "3")];
        assert_eq!(state.on_diff(update), DiffOutcome::Applied { last_update_id: 5 });

        let mut update = diff(6, 6);
        update.bids = vec![level("0.15", "1")];
        state.on_diff(update);

        let book = state.order_book(None).unwrap();
        assert_eq!(book.bids, vec![level("0.15", "1")]);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn test_policy_for_family() {
        assert_eq!(
            ContiguityPolicy::for_family(MarketFamily::Spot),
            ContiguityPolicy::Range
        );
        assert_eq!(
            ContiguityPolicy::for_family(MarketFamily::CoinFutures),
            ContiguityPolicy::PreviousId
        );
        assert!(!ContiguityPolicy::for_family(MarketFamily::Options).needs_snapshot());
    }
}
