//! WebSocket streaming.
//!
//! - [`session`]: one socket with reconnect/backoff state machine
//! - [`keepalive`]: sessions kept alive by listen key renewal
//! - [`router`]: request/response correlation and push routing
//! - [`multiplexer`]: many subscriptions over shared sockets
//! - [`state`]: local order book caches
//!
//! # Example
//!
//! ```rust,ignore
//! use binance_streams::prelude::*;
//! use futures_util::StreamExt;
//!
//! let mux = Multiplexer::new(MultiplexerConfig::default());
//! let (_handle, mut trades) = mux
//!     .subscribe_channel(MarketFamily::Spot, &trade_stream(MarketFamily::Spot, "BTCUSDT"), 1024)
//!     .await?;
//!
//! while let Some(StreamItem::Message(msg)) = trades.next().await {
//!     println!("{}", msg.data);
//! }
//! ```

pub mod depth;
pub mod error;
pub mod keepalive;
pub mod multiplexer;
pub mod router;
pub mod session;
pub mod state;
pub mod streams;
pub mod transport;
pub mod types;

pub use depth::{DepthUpdate, OrderBookDiff, OrderBookLevel, OrderBookSnapshot, SnapshotSource};
#[cfg(feature = "rest")]
pub use depth::RestSnapshotSource;
pub use error::{WebSocketError, WsResult};
pub use keepalive::{KeepAliveConfig, KeepAliveSession, ListenKeyProvider};
#[cfg(feature = "rest")]
pub use keepalive::RestListenKeyProvider;
pub use multiplexer::{
    Multiplexer, MultiplexerConfig, MultiplexerEvent, SubscriptionHandle, SubscriptionId,
    SubscriptionStream,
};
pub use router::{PendingResponse, RequestRouter, RouteOutcome};
pub use session::{
    Backoff, ConnectionSession, ConnectionState, SessionConfig, SessionEvent, SessionId,
    SessionInput, SessionSender, Transition,
};
pub use state::{
    CacheEvent, CacheState, ContiguityPolicy, DepthCacheConfig, DiffOutcome, OrderBook,
    OrderBookCache, OrderBookReader, SnapshotOutcome,
};
pub use transport::{BoxTransport, Connector, Endpoint, Transport, TungsteniteConnector};
pub use types::{InboundFrame, ResponseError, StreamItem, StreamMessage, WsRequest};
