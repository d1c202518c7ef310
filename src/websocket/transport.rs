//! Transport seams.
//!
//! A session never dials a socket itself: it asks an [`Endpoint`] for the URL
//! and a [`Connector`] for the socket. Production uses [`TungsteniteConnector`];
//! tests plug in in-memory transports.

use std::pin::Pin;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message};

use crate::websocket::error::{WebSocketError, WsResult};

/// Handshake timeout used by [`TungsteniteConnector::default`]
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected, message-framed socket.
pub trait Transport:
    Stream<Item = Result<Message, TungsteniteError>> + Sink<Message, Error = TungsteniteError> + Send + Unpin
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Message, TungsteniteError>>
        + Sink<Message, Error = TungsteniteError>
        + Send
        + Unpin
{
}

/// Owned, type-erased transport. Pinned so the `Sink` impl comes from `Pin<P>`.
pub type BoxTransport = Pin<Box<dyn Transport>>;

/// Performs the WebSocket handshake.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, WsResult<BoxTransport>>;
}

/// Resolves the URL to dial. Called before every handshake, so an endpoint
/// may hand out a different URL per connection.
pub trait Endpoint: Send + Sync + 'static {
    fn resolve(&self) -> BoxFuture<'static, WsResult<String>>;
}

impl Endpoint for String {
    fn resolve(&self) -> BoxFuture<'static, WsResult<String>> {
        let url = self.clone();
        Box::pin(async move { Ok(url) })
    }
}

/// `tokio-tungstenite` connector
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(CONNECTION_TIMEOUT)
    }
}

impl Connector for TungsteniteConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, WsResult<BoxTransport>> {
        let timeout = self.timeout;
        Box::pin(async move {
            let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
                .await
                .map_err(|_| WebSocketError::Timeout)?
                .map_err(WebSocketError::from)?;
            Ok(Box::pin(stream) as BoxTransport)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_endpoint_resolves_to_itself() {
        let endpoint = "wss://stream.binance.com:9443/stream".to_string();
        let url = tokio_test::assert_ok!(tokio_test::block_on(endpoint.resolve()));
        assert_eq!(url, "wss://stream.binance.com:9443/stream");
    }

    #[test]
    fn test_boxed_transport_is_stream_and_sink() {
        fn assert_transport<T>()
        where
            T: Stream<Item = Result<Message, TungsteniteError>>
                + Sink<Message, Error = TungsteniteError>
                + Send
                + Unpin,
        {
        }
        assert_transport::<BoxTransport>();
    }

    #[tokio::test]
    async fn test_invalid_url_fails_handshake() {
        let connector = TungsteniteConnector::new(Duration::from_secs(1));
        let result = connector.connect("not a url".to_string()).await;
        assert!(result.is_err());
    }
}
