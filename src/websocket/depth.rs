//! Order book wire types and the snapshot collaborator.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::network::MarketFamily;
use crate::websocket::error::WsResult;

/// One price level. Zero quantity removes the level.
///
/// On the wire a level is a `[price, quantity]` pair of decimal strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Decimal, Decimal)", into = "(Decimal, Decimal)")]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl OrderBookLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

impl From<(Decimal, Decimal)> for OrderBookLevel {
    fn from((price, quantity): (Decimal, Decimal)) -> Self {
        Self { price, quantity }
    }
}

impl From<OrderBookLevel> for (Decimal, Decimal) {
    fn from(level: OrderBookLevel) -> Self {
        (level.price, level.quantity)
    }
}

/// REST depth snapshot
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

/// Depth event as pushed on the diff stream.
///
/// `U` is absent on options events, `pu` on spot events.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepthUpdate {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", with = "chrono::serde::ts_milliseconds")]
    pub event_time: DateTime<Utc>,
    #[serde(rename = "T", default, with = "chrono::serde::ts_milliseconds_option")]
    pub transaction_time: Option<DateTime<Utc>>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U", default)]
    pub first_update_id: Option<u64>,
    #[serde(rename = "u")]
    pub last_update_id: u64,
    #[serde(rename = "pu", default)]
    pub previous_update_id: Option<u64>,
    #[serde(rename = "b")]
    pub bids: Vec<OrderBookLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<OrderBookLevel>,
}

/// A diff ready for the cache
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookDiff {
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub previous_update_id: Option<u64>,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBookDiff {
    /// Whether `id` falls inside `[first_update_id, last_update_id]`
    pub fn covers(&self, id: u64) -> bool {
        self.first_update_id <= id && id <= self.last_update_id
    }
}

impl From<DepthUpdate> for OrderBookDiff {
    fn from(update: DepthUpdate) -> Self {
        Self {
            first_update_id: update.first_update_id.unwrap_or(update.last_update_id),
            last_update_id: update.last_update_id,
            previous_update_id: update.previous_update_id,
            bids: update.bids,
            asks: update.asks,
        }
    }
}

/// Fetches REST depth snapshots.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch(
        &self,
        family: MarketFamily,
        symbol: &str,
        limit: u32,
    ) -> BoxFuture<'static, WsResult<OrderBookSnapshot>>;
}

#[cfg(feature = "rest")]
pub use rest::RestSnapshotSource;

#[cfg(feature = "rest")]
mod rest {
    use super::*;

    /// Snapshot source backed by the public depth endpoints.
    #[derive(Debug, Clone)]
    pub struct RestSnapshotSource {
        client: reqwest::Client,
        base_url: Option<String>,
    }

    impl RestSnapshotSource {
        pub fn new() -> WsResult<Self> {
            Ok(Self {
                client: crate::http::build_client(None)?,
                base_url: None,
            })
        }

        /// Use one base URL for every family (mock servers, testnets).
        pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
            self.base_url = Some(base_url.into());
            self
        }

        fn url(&self, family: MarketFamily) -> String {
            let base = self
                .base_url
                .as_deref()
                .unwrap_or_else(|| family.api_base_url())
                .trim_end_matches('/');
            format!("{}{}", base, family.depth_path())
        }
    }

    impl SnapshotSource for RestSnapshotSource {
        fn fetch(
            &self,
            family: MarketFamily,
            symbol: &str,
            limit: u32,
        ) -> BoxFuture<'static, WsResult<OrderBookSnapshot>> {
            let request = self
                .client
                .get(self.url(family))
                .query(&[("symbol", symbol.to_uppercase()), ("limit", limit.to_string())]);
            let symbol = symbol.to_uppercase();

            Box::pin(async move {
                tracing::debug!("Fetching {} depth snapshot for {}", family, symbol);
                let response = request.send().await?;
                crate::http::parse_response(response).await
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_snapshot_urls() {
            let source = RestSnapshotSource::new().unwrap();
            assert_eq!(
                source.url(MarketFamily::Spot),
                "https://api.binance.com/api/v3/depth"
            );
            assert_eq!(
                source.url(MarketFamily::CoinFutures),
                "https://dapi.binance.com/dapi/v1/depth"
            );

            let source = source.with_base_url("http://127.0.0.1:8080/");
            assert_eq!(
                source.url(MarketFamily::UsdFutures),
                "http://127.0.0.1:8080/fapi/v1/depth"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_snapshot() {
        let json = r#"{
            "lastUpdateId": 1027024,
            "bids": [["4.00000000", "431.00000000"]],
            "asks": [["4.00000200", "12.00000000"]]
        }"#;
        let snapshot: OrderBookSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.last_update_id, 1027024);
        assert_eq!(snapshot.bids[0], OrderBookLevel::new(d("4.00000000"), d("431")));
        assert_eq!(snapshot.asks[0].price, d("4.000002"));
    }

    #[test]
    fn test_parse_spot_diff() {
        let json = r#"{
            "e": "depthUpdate", "E": 1672515782136, "s": "BNBBTC",
            "U": 157, "u": 160,
            "b": [["0.0024", "10"]],
            "a": [["0.0026", "0"]]
        }"#;
        let update: DepthUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.previous_update_id, None);
        assert_eq!(update.transaction_time, None);

        let diff = OrderBookDiff::from(update);
        assert_eq!(diff.first_update_id, 157);
        assert_eq!(diff.last_update_id, 160);
        assert!(diff.asks[0].is_removal());
        assert!(diff.covers(158));
        assert!(!diff.covers(161));
    }

    #[test]
    fn test_parse_futures_diff() {
        let json = r#"{
            "e": "depthUpdate", "E": 123456789, "T": 123456788, "s": "BTCUSDT",
            "U": 157, "u": 160, "pu": 149,
            "b": [["0.0024", "10"]], "a": [["0.0026", "100"]]
        }"#;
        let update: DepthUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.previous_update_id, Some(149));
        assert!(update.transaction_time.is_some());
    }

    #[test]
    fn test_parse_options_depth() {
        let json = r#"{
            "e": "depth", "E": 1591695934010, "T": 1591695934000,
            "s": "BTC-200630-9000-P", "u": 162, "pu": 162,
            "b": [["0.1000", "0.9901"]], "a": [["0.2000", "0.1000"]]
        }"#;
        let diff = OrderBookDiff::from(serde_json::from_str::<DepthUpdate>(json).unwrap());
        assert_eq!(diff.first_update_id, 162);
        assert_eq!(diff.last_update_id, 162);
    }
}
