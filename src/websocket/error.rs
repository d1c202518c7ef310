//! WebSocket-specific error types.

use thiserror::Error;

/// Errors produced by the streaming subsystem
#[derive(Debug, Clone, Error)]
pub enum WebSocketError {
    /// Handshake failure
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed by the remote side
    #[error("Connection closed: code {code}, reason: {reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// The socket left STREAMING while a request was outstanding
    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    /// Retry budget exhausted, the session is in EXITING
    #[error("Session closed permanently after {attempts} failed reconnect attempts")]
    RetriesExhausted { attempts: u32 },

    /// The session was closed on request
    #[error("Session closed")]
    SessionClosed,

    /// JSON deserialization failure
    #[error("Failed to parse message: {0}")]
    MessageParseError(String),

    /// Detected sequence gap in depth updates
    #[error("Sequence gap detected: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    /// Order book is rebuilding from a fresh snapshot
    #[error("Order book for {symbol} is resyncing")]
    Resyncing { symbol: String },

    /// Client ping not answered
    #[error("Ping timeout: no pong response received")]
    PingTimeout,

    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    /// Error code inside an otherwise well-formed response
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },

    /// Not connected
    #[error("Not connected to WebSocket server")]
    NotConnected,

    /// Send failed
    #[error("Failed to send message: {0}")]
    SendFailed(String),

    /// Channel closed
    #[error("Internal channel closed")]
    ChannelClosed,

    /// Invalid URL
    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    /// Handshake timeout
    #[error("Operation timed out")]
    Timeout,

    /// No response for a correlated request in time
    #[error("Request {id} timed out")]
    RequestTimeout { id: u64 },

    /// Request abandoned because the owner shut down
    #[error("Request cancelled")]
    Cancelled,

    /// Subscription rejected or unknown
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// HTTP request error (snapshot / listen key collaborators)
    #[error("HTTP request error: {0}")]
    HttpError(String),

    /// Listen key issue/renew/revoke failure
    #[error("Listen key error: {0}")]
    ListenKey(String),

    /// The threaded runtime is not running
    #[error("Runtime is not running")]
    RuntimeStopped,
}

impl WebSocketError {
    /// Whether this error came from the exchange rather than the transport
    pub fn is_application_error(&self) -> bool {
        matches!(self, WebSocketError::Api { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WebSocketError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed => WebSocketError::ConnectionClosed {
                code: 1000,
                reason: "Connection closed normally".to_string(),
            },
            Error::AlreadyClosed => WebSocketError::NotConnected,
            Error::Io(e) => WebSocketError::Io(e.to_string()),
            Error::Protocol(e) => WebSocketError::Protocol(e.to_string()),
            Error::Url(e) => WebSocketError::InvalidUrl(e.to_string()),
            Error::Http(resp) => {
                WebSocketError::ConnectionFailed(format!("HTTP error: {:?}", resp.status()))
            }
            Error::HttpFormat(e) => WebSocketError::ConnectionFailed(e.to_string()),
            other => WebSocketError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for WebSocketError {
    fn from(err: serde_json::Error) -> Self {
        WebSocketError::MessageParseError(err.to_string())
    }
}

#[cfg(feature = "rest")]
impl From<reqwest::Error> for WebSocketError {
    fn from(err: reqwest::Error) -> Self {
        WebSocketError::HttpError(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WebSocketError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        WebSocketError::ChannelClosed
    }
}

/// Result type alias for WebSocket operations
pub type WsResult<T> = Result<T, WebSocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tungstenite_close_maps_to_connection_closed() {
        let err = WebSocketError::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, WebSocketError::ConnectionClosed { code: 1000, .. }));
    }

    #[test]
    fn test_api_error_is_application_error() {
        let err = WebSocketError::Api {
            code: -1121,
            message: "Invalid symbol.".to_string(),
        };
        assert!(err.is_application_error());
        assert!(!WebSocketError::Timeout.is_application_error());
        assert_eq!(err.to_string(), "API error -1121: Invalid symbol.");
    }
}
