//! Network URL constants and market families.

use std::fmt;

/// Spot WebSocket base URL.
pub const SPOT_WS_URL: &str = "wss://stream.binance.com:9443";

/// USD-margined futures WebSocket base URL.
pub const USD_FUTURES_WS_URL: &str = "wss://fstream.binance.com";

/// Coin-margined futures WebSocket base URL.
pub const COIN_FUTURES_WS_URL: &str = "wss://dstream.binance.com";

/// European options WebSocket base URL.
pub const OPTIONS_WS_URL: &str = "wss://nbstream.binance.com/eoptions";

/// Spot REST base URL.
pub const SPOT_API_URL: &str = "https://api.binance.com";

/// USD-margined futures REST base URL.
pub const USD_FUTURES_API_URL: &str = "https://fapi.binance.com";

/// Coin-margined futures REST base URL.
pub const COIN_FUTURES_API_URL: &str = "https://dapi.binance.com";

/// European options REST base URL.
pub const OPTIONS_API_URL: &str = "https://eapi.binance.com";

/// A market family. Each family has its own socket endpoint, so streams of
/// different families never share a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketFamily {
    Spot,
    UsdFutures,
    CoinFutures,
    Options,
}

impl MarketFamily {
    /// All families, in declaration order.
    pub const ALL: [MarketFamily; 4] = [
        MarketFamily::Spot,
        MarketFamily::UsdFutures,
        MarketFamily::CoinFutures,
        MarketFamily::Options,
    ];

    /// Default WebSocket base URL (no path).
    pub fn ws_base_url(&self) -> &'static str {
        match self {
            MarketFamily::Spot => SPOT_WS_URL,
            MarketFamily::UsdFutures => USD_FUTURES_WS_URL,
            MarketFamily::CoinFutures => COIN_FUTURES_WS_URL,
            MarketFamily::Options => OPTIONS_WS_URL,
        }
    }

    /// Default REST base URL.
    pub fn api_base_url(&self) -> &'static str {
        match self {
            MarketFamily::Spot => SPOT_API_URL,
            MarketFamily::UsdFutures => USD_FUTURES_API_URL,
            MarketFamily::CoinFutures => COIN_FUTURES_API_URL,
            MarketFamily::Options => OPTIONS_API_URL,
        }
    }

    /// REST path of the order book snapshot endpoint.
    pub fn depth_path(&self) -> &'static str {
        match self {
            MarketFamily::Spot => "/api/v3/depth",
            MarketFamily::UsdFutures => "/fapi/v1/depth",
            MarketFamily::CoinFutures => "/dapi/v1/depth",
            MarketFamily::Options => "/eapi/v1/depth",
        }
    }

    /// REST path of the listen key endpoint.
    pub fn listen_key_path(&self) -> &'static str {
        match self {
            MarketFamily::Spot => "/api/v3/userDataStream",
            MarketFamily::UsdFutures => "/fapi/v1/listenKey",
            MarketFamily::CoinFutures => "/dapi/v1/listenKey",
            MarketFamily::Options => "/eapi/v1/listenKey",
        }
    }
}

impl fmt::Display for MarketFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarketFamily::Spot => "spot",
            MarketFamily::UsdFutures => "usd-futures",
            MarketFamily::CoinFutures => "coin-futures",
            MarketFamily::Options => "options",
        };
        f.write_str(name)
    }
}

/// Per-family WebSocket base URLs. Override a field to point a family at a
/// different host (local mock servers in tests, for instance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub spot: String,
    pub usd_futures: String,
    pub coin_futures: String,
    pub options: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            spot: SPOT_WS_URL.to_string(),
            usd_futures: USD_FUTURES_WS_URL.to_string(),
            coin_futures: COIN_FUTURES_WS_URL.to_string(),
            options: OPTIONS_WS_URL.to_string(),
        }
    }
}

impl Endpoints {
    /// Base URL for a family.
    pub fn base(&self, family: MarketFamily) -> &str {
        match family {
            MarketFamily::Spot => &self.spot,
            MarketFamily::UsdFutures => &self.usd_futures,
            MarketFamily::CoinFutures => &self.coin_futures,
            MarketFamily::Options => &self.options,
        }
    }

    /// Combined-stream URL: streams are added with SUBSCRIBE frames and every
    /// frame arrives wrapped as `{"stream": ..., "data": ...}`.
    pub fn combined_stream_url(&self, family: MarketFamily) -> String {
        format!("{}/stream", self.base(family).trim_end_matches('/'))
    }

    /// Raw single-stream URL (`{base}/ws/{path}`), used for user data streams.
    pub fn raw_stream_url(&self, family: MarketFamily, path: &str) -> String {
        format!("{}/ws/{}", self.base(family).trim_end_matches('/'), path)
    }
}
