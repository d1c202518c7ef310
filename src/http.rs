//! Minimal REST plumbing shared by the default snapshot and listen key
//! collaborators.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::websocket::error::{WebSocketError, WsResult};
use crate::websocket::types::ApiErrorBody;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Build the shared HTTP client.
pub fn build_client(timeout: Option<Duration>) -> WsResult<Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json"),
    );

    let client = Client::builder()
        .timeout(timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
        .pool_max_idle_per_host(4)
        .default_headers(headers)
        .build()?;
    Ok(client)
}

/// Turn a successful response into `T`, anything else into an error.
pub async fn parse_response<T: serde::de::DeserializeOwned>(response: Response) -> WsResult<T> {
    if response.status().is_success() {
        let body = response.text().await?;
        return Ok(serde_json::from_str(&body)?);
    }
    Err(parse_error_response(response).await)
}

/// Parse an error response. Exchange error bodies (`{"code","msg"}`) become
/// `Api` errors; anything else is reported with its HTTP status.
pub async fn parse_error_response(response: Response) -> WebSocketError {
    let status = response.status();
    let error_text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Failed to read error response body: {}", e);
            return map_status_error(status, format!("body unreadable: {}", e));
        }
    };

    match serde_json::from_str::<ApiErrorBody>(&error_text) {
        Ok(body) => body.into(),
        Err(_) => map_status_error(status, error_text),
    }
}

fn map_status_error(status: StatusCode, text: String) -> WebSocketError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            WebSocketError::HttpError(format!("Rate limited (HTTP 429): {}", text))
        }
        _ => WebSocketError::HttpError(format!("HTTP {}: {}", status.as_u16(), text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status_error() {
        let err = map_status_error(StatusCode::TOO_MANY_REQUESTS, "slow down".to_string());
        assert!(err.to_string().contains("Rate limited"));

        let err = map_status_error(StatusCode::BAD_GATEWAY, "".to_string());
        assert_eq!(err.to_string(), "HTTP request error: HTTP 502: ");
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(Some(Duration::from_secs(1))).is_ok());
    }
}
