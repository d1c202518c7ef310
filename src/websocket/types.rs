//! Wire types for the Binance stream protocol.
//!
//! Outbound control frames, inbound frame classification, and the message
//! types handed to subscribers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::websocket::error::{WebSocketError, WsResult};

// ============================================================================
// REQUEST TYPES (Client → Server)
// ============================================================================

/// Request-style frame. The `id` is echoed by the server in its response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: u64,
}

impl WsRequest {
    /// Arbitrary request
    pub fn new(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }

    /// `SUBSCRIBE` control frame
    pub fn subscribe(stream_keys: &[String], id: u64) -> Self {
        Self::new("SUBSCRIBE", Some(Value::from(stream_keys.to_vec())), id)
    }

    /// `UNSUBSCRIBE` control frame
    pub fn unsubscribe(stream_keys: &[String], id: u64) -> Self {
        Self::new("UNSUBSCRIBE", Some(Value::from(stream_keys.to_vec())), id)
    }

    /// `LIST_SUBSCRIPTIONS` request
    pub fn list_subscriptions(id: u64) -> Self {
        Self::new("LIST_SUBSCRIPTIONS", None, id)
    }
}

// ============================================================================
// RESPONSE TYPES (Server → Client)
// ============================================================================

/// Error member of a response frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    #[serde(alias = "message")]
    pub msg: String,
}

impl From<ApiErrorBody> for WebSocketError {
    fn from(body: ApiErrorBody) -> Self {
        WebSocketError::Api {
            code: body.code,
            message: body.msg,
        }
    }
}

/// Error member of a response, as received
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseError {
    /// Well-formed `{code, msg}` application error
    Api(ApiErrorBody),
    /// An `error` member of any other shape
    Unreadable(Value),
}

impl From<ResponseError> for WebSocketError {
    fn from(error: ResponseError) -> Self {
        match error {
            ResponseError::Api(body) => body.into(),
            ResponseError::Unreadable(raw) => {
                WebSocketError::Protocol(format!("Unreadable error member: {}", raw))
            }
        }
    }
}

/// An inbound text frame, classified
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Response to a request carrying `id`
    Response {
        id: u64,
        result: Result<Value, ResponseError>,
    },
    /// Response whose `id` is not one we could have issued
    UnknownResponse { raw_id: Value },
    /// Push event. `stream` is set on combined-stream sockets, absent on raw ones.
    Push { stream: Option<String>, data: Value },
}

impl InboundFrame {
    /// Classify a text frame.
    ///
    /// Responses are objects with an `id` and one of `result`, `error` or
    /// `status`. Combined-stream pushes carry `stream` + `data`. Anything else
    /// that is valid JSON is an unkeyed push.
    pub fn parse(text: &str) -> WsResult<Self> {
        let value: Value = serde_json::from_str(text)?;

        let Value::Object(mut map) = value else {
            return Ok(InboundFrame::Push {
                stream: None,
                data: value,
            });
        };

        let is_response = map.contains_key("id")
            && (map.contains_key("result") || map.contains_key("error") || map.contains_key("status"));

        if is_response {
            let raw_id = map.remove("id").unwrap_or(Value::Null);
            let Some(id) = parse_id(&raw_id) else {
                return Ok(InboundFrame::UnknownResponse { raw_id });
            };

            let result = match map.remove("error") {
                Some(Value::Null) | None => Ok(map.remove("result").unwrap_or(Value::Null)),
                // the waiter still gets an answer when the body is odd
                Some(error) => Err(match ApiErrorBody::deserialize(&error) {
                    Ok(body) => ResponseError::Api(body),
                    Err(_) => ResponseError::Unreadable(error),
                }),
            };
            return Ok(InboundFrame::Response { id, result });
        }

        if map.contains_key("data") && map.get("stream").is_some_and(Value::is_string) {
            if let Some(Value::String(stream)) = map.remove("stream") {
                let data = map.remove("data").unwrap_or(Value::Null);
                return Ok(InboundFrame::Push {
                    stream: Some(stream),
                    data,
                });
            }
        }

        Ok(InboundFrame::Push {
            stream: None,
            data: Value::Object(map),
        })
    }
}

fn parse_id(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ============================================================================
// DELIVERED TYPES
// ============================================================================

/// A push event delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Stream key the event arrived on (empty for raw user-data sockets)
    pub stream: String,
    /// Event payload
    pub data: Value,
}

impl StreamMessage {
    /// Deserialize the payload into a typed event.
    pub fn parse<T: DeserializeOwned>(&self) -> WsResult<T> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Event type (`e` field), when present
    pub fn event_type(&self) -> Option<&str> {
        self.data.get("e").and_then(Value::as_str)
    }
}

/// What a delivery target receives
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A push event for the subscribed stream
    Message(StreamMessage),
    /// The stream is permanently closed and must be recreated if needed
    Closed { reason: String },
}
