//! # binance-streams
//!
//! Resilient streaming client for Binance market and user data WebSockets.
//!
//! ## Modules
//!
//! - [`websocket`]: reconnecting sessions, request routing, stream
//!   multiplexing and local order book caches
//! - [`runtime`]: blocking, callback-based facade running the async stack on
//!   its own thread
//! - [`network`]: market families and endpoint URLs
//!
//! ## Quick Start - async
//!
//! ```rust,ignore
//! use binance_streams::prelude::*;
//! use futures_util::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WebSocketError> {
//!     let mux = Multiplexer::new(MultiplexerConfig::default());
//!     let key = trade_stream(MarketFamily::Spot, "BTCUSDT");
//!     let (_handle, mut trades) = mux.subscribe_channel(MarketFamily::Spot, &key, 1024).await?;
//!
//!     while let Some(StreamItem::Message(msg)) = trades.next().await {
//!         println!("{}: {}", msg.stream, msg.data);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Quick Start - blocking
//!
//! ```rust,ignore
//! use binance_streams::prelude::*;
//!
//! let runtime = ThreadedRuntime::new(RuntimeConfig::default());
//! runtime.start()?;
//!
//! let book = runtime.start_depth_cache(
//!     MarketFamily::Spot,
//!     "BTCUSDT",
//!     DepthCacheConfig::default(),
//!     std::sync::Arc::new(RestSnapshotSource::new()?),
//! )?;
//! std::thread::sleep(std::time::Duration::from_secs(2));
//! println!("spread: {:?}", book.spread());
//!
//! runtime.stop()?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

/// Market families and endpoint URLs.
pub mod network;

/// Blocking facade over the async streaming stack.
pub mod runtime;

/// WebSocket sessions, routing, multiplexing and order book caches.
pub mod websocket;

#[cfg(feature = "rest")]
mod http;

// ============================================================================
// PRELUDE
// ============================================================================

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use binance_streams::prelude::*;
/// ```
pub mod prelude {
    pub use crate::network::{Endpoints, MarketFamily};

    pub use crate::runtime::{
        DepthCacheHandle, MessageIter, RuntimeConfig, RuntimeError, ThreadedRuntime,
    };

    pub use crate::websocket::{
        // Errors
        WebSocketError, WsResult,
        // Sessions
        ConnectionSession, ConnectionState, SessionConfig, SessionEvent, SessionId, Transition,
        KeepAliveConfig, KeepAliveSession, ListenKeyProvider,
        // Multiplexing
        Multiplexer, MultiplexerConfig, MultiplexerEvent, SubscriptionHandle, SubscriptionId,
        SubscriptionStream, StreamItem, StreamMessage,
        // Order books
        DepthCacheConfig, OrderBook, OrderBookCache, OrderBookLevel, OrderBookSnapshot,
        SnapshotSource, CacheEvent,
    };

    #[cfg(feature = "rest")]
    pub use crate::websocket::{RestListenKeyProvider, RestSnapshotSource};

    // Stream name builders
    pub use crate::websocket::streams::{
        agg_trade_stream, book_ticker_stream, depth_stream, kline_stream, mark_price_stream,
        mini_ticker_stream, partial_depth_stream, ticker_stream, trade_stream,
    };
}
