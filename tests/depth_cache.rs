//! Order book cache synchronization end to end over a mock socket.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use binance_streams::network::MarketFamily;
use binance_streams::websocket::streams::depth_stream;
use binance_streams::websocket::{
    CacheEvent, DepthCacheConfig, Multiplexer, OrderBookCache, OrderBookLevel, OrderBookSnapshot,
    SnapshotSource, WebSocketError, WsResult,
};
use common::*;
use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

type Responder = oneshot::Sender<WsResult<OrderBookSnapshot>>;

/// Snapshot source answered by the test, one fetch at a time.
struct GatedSource {
    fetches: AtomicUsize,
    requests: mpsc::UnboundedSender<Responder>,
}

impl GatedSource {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Responder>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                requests,
            }),
            rx,
        )
    }
}

impl SnapshotSource for GatedSource {
    fn fetch(
        &self,
        _family: MarketFamily,
        _symbol: &str,
        _limit: u32,
    ) -> BoxFuture<'static, WsResult<OrderBookSnapshot>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let _ = self.requests.send(tx);
        Box::pin(async move { rx.await.map_err(|_| WebSocketError::Cancelled)? })
    }
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn snapshot(last_update_id: u64) -> OrderBookSnapshot {
    OrderBookSnapshot {
        last_update_id,
        bids: vec![
            OrderBookLevel::new(d("100.0"), d("1.5")),
            OrderBookLevel::new(d("99.5"), d("2")),
        ],
        asks: vec![
            OrderBookLevel::new(d("100.5"), d("1")),
            OrderBookLevel::new(d("101.0"), d("4")),
        ],
    }
}

fn depth_event(first: u64, last: u64, bids: Value, asks: Value) -> Value {
    json!({
        "e": "depthUpdate",
        "E": 1_700_000_000_000u64,
        "s": "BTCUSDT",
        "U": first,
        "u": last,
        "b": bids,
        "a": asks,
    })
}

async fn next_responder(requests: &mut mpsc::UnboundedReceiver<Responder>) -> Responder {
    tokio::time::timeout(WAIT, requests.recv())
        .await
        .expect("timed out waiting for a snapshot fetch")
        .expect("source dropped")
}

async fn next_event(events: &mut mpsc::Receiver<CacheEvent>) -> CacheEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a cache event")
        .expect("cache event channel closed")
}

#[tokio::test]
async fn test_bridges_snapshot_applies_live_diffs_and_resyncs_on_gap() {
    let (connector, mut servers) = MockConnector::accepting();
    let mux = Arc::new(Multiplexer::with_connector(mock_multiplexer_config(), connector));
    let (source, mut requests) = GatedSource::new();

    let (mut cache, mut events) = OrderBookCache::start(
        Arc::clone(&mux),
        MarketFamily::Spot,
        "BTCUSDT",
        DepthCacheConfig::default(),
        source.clone(),
    )
    .await
    .unwrap();
    assert!(!cache.is_consistent());
    assert!(matches!(
        cache.order_book(None),
        Err(WebSocketError::Resyncing { .. })
    ));

    let key = depth_stream(MarketFamily::Spot, "BTCUSDT", 100);
    assert_eq!(key, "btcusdt@depth@100ms");
    let mut server = next_server(&mut servers).await;
    server.ack_subscriptions(&[&key]).await;

    // buffered while the snapshot is in flight: one stale, one bridging
    server.push(&key, depth_event(990, 999, json!([]), json!([])));
    server.push(
        &key,
        depth_event(995, 1005, json!([["100.0", "0"]]), json!([["100.5", "3"]])),
    );
    settle().await;

    next_responder(&mut requests).await.send(Ok(snapshot(1000))).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        CacheEvent::Synced {
            last_update_id: 1005
        }
    );

    let book = cache.order_book(None).unwrap();
    assert_eq!(book.last_update_id, 1005);
    assert_eq!(book.bids, vec![OrderBookLevel::new(d("99.5"), d("2"))]);
    assert_eq!(cache.best_ask(), Some(OrderBookLevel::new(d("100.5"), d("3"))));
    assert_eq!(cache.spread(), Some(d("1.0")));

    server.push(&key, depth_event(1006, 1010, json!([["99.8", "5"]]), json!([])));
    assert_eq!(
        next_event(&mut events).await,
        CacheEvent::Updated {
            last_update_id: 1010
        }
    );
    assert_eq!(cache.best_bid(), Some(OrderBookLevel::new(d("99.8"), d("5"))));
    assert_eq!(cache.order_book(Some(1)).unwrap().bids.len(), 1);

    // 1011..=1019 never arrive
    server.push(&key, depth_event(1020, 1025, json!([]), json!([])));
    assert!(matches!(
        next_event(&mut events).await,
        CacheEvent::Resyncing { .. }
    ));
    assert!(!cache.is_consistent());
    assert!(cache.best_bid().is_none());

    let responder = next_responder(&mut requests).await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

    server.push(&key, depth_event(1026, 1030, json!([]), json!([["102", "1"]])));
    settle().await;
    responder.send(Ok(snapshot(1024))).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        CacheEvent::Synced {
            last_update_id: 1030
        }
    );
    assert_eq!(cache.order_book(None).unwrap().asks.len(), 3);

    cache.close().await.unwrap();
    assert_eq!(mux.session_count().await, 0);
}

#[tokio::test]
async fn test_unbridgeable_snapshot_triggers_refetch() {
    let (connector, mut servers) = MockConnector::accepting();
    let mux = Arc::new(Multiplexer::with_connector(mock_multiplexer_config(), connector));
    let (source, mut requests) = GatedSource::new();

    let (_cache, mut events) = OrderBookCache::start(
        Arc::clone(&mux),
        MarketFamily::Spot,
        "BTCUSDT",
        DepthCacheConfig::default(),
        source.clone(),
    )
    .await
    .unwrap();
    let key = depth_stream(MarketFamily::Spot, "BTCUSDT", 100);
    let mut server = next_server(&mut servers).await;
    server.ack_subscriptions(&[&key]).await;

    server.push(&key, depth_event(1010, 1015, json!([]), json!([])));
    settle().await;
    next_responder(&mut requests).await.send(Ok(snapshot(1000))).unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        CacheEvent::Resyncing { .. }
    ));
    let _second = next_responder(&mut requests).await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_snapshot_is_retried() {
    let (connector, mut servers) = MockConnector::accepting();
    let mux = Arc::new(Multiplexer::with_connector(mock_multiplexer_config(), connector));
    let (source, mut requests) = GatedSource::new();
    let config = DepthCacheConfig {
        snapshot_retry_delay_ms: 10,
        ..DepthCacheConfig::default()
    };

    let (cache, mut events) = OrderBookCache::start(
        Arc::clone(&mux),
        MarketFamily::Spot,
        "BTCUSDT",
        config,
        source.clone(),
    )
    .await
    .unwrap();
    let key = depth_stream(MarketFamily::Spot, "BTCUSDT", 100);
    let mut server = next_server(&mut servers).await;
    server.ack_subscriptions(&[&key]).await;

    next_responder(&mut requests)
        .await
        .send(Err(WebSocketError::HttpError("HTTP 503".to_string())))
        .unwrap();
    next_responder(&mut requests).await.send(Ok(snapshot(1000))).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        CacheEvent::Synced {
            last_update_id: 1000
        }
    );
    assert!(cache.is_consistent());
}

#[tokio::test]
async fn test_futures_cache_chains_on_previous_id() {
    let (connector, mut servers) = MockConnector::accepting();
    let mux = Arc::new(Multiplexer::with_connector(mock_multiplexer_config(), connector));
    let (source, mut requests) = GatedSource::new();

    let (cache, mut events) = OrderBookCache::start(
        Arc::clone(&mux),
        MarketFamily::UsdFutures,
        "BTCUSDT",
        DepthCacheConfig::default(),
        source,
    )
    .await
    .unwrap();
    let key = depth_stream(MarketFamily::UsdFutures, "BTCUSDT", 100);
    let mut server = next_server(&mut servers).await;
    server.ack_subscriptions(&[&key]).await;

    let event = |first: u64, last: u64, prev: u64| {
        let mut event = depth_event(first, last, json!([]), json!([]));
        event["pu"] = json!(prev);
        event["T"] = json!(1_700_000_000_000u64);
        event
    };
    server.push(&key, event(990, 1002, 989));
    settle().await;
    next_responder(&mut requests).await.send(Ok(snapshot(1000))).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        CacheEvent::Synced {
            last_update_id: 1002
        }
    );

    // futures ids skip; only `pu` has to chain
    server.push(&key, event(1007, 1009, 1002));
    assert_eq!(
        next_event(&mut events).await,
        CacheEvent::Updated {
            last_update_id: 1009
        }
    );

    server.push(&key, event(1012, 1014, 1010));
    assert!(matches!(
        next_event(&mut events).await,
        CacheEvent::Resyncing { .. }
    ));
    assert!(!cache.is_consistent());
}

#[tokio::test]
async fn test_malformed_depth_event_is_reported() {
    let (connector, mut servers) = MockConnector::accepting();
    let mux = Arc::new(Multiplexer::with_connector(mock_multiplexer_config(), connector));
    let (source, _requests) = GatedSource::new();

    let (_cache, mut events) = OrderBookCache::start(
        Arc::clone(&mux),
        MarketFamily::Spot,
        "BTCUSDT",
        DepthCacheConfig::default(),
        source,
    )
    .await
    .unwrap();
    let key = depth_stream(MarketFamily::Spot, "BTCUSDT", 100);
    let mut server = next_server(&mut servers).await;
    server.ack_subscriptions(&[&key]).await;

    server.push(&key, json!({ "e": "depthUpdate", "u": "not a number" }));
    assert!(matches!(
        next_event(&mut events).await,
        CacheEvent::ProtocolError(_)
    ));
}
