//! Sessions whose URL carries an externally issued listen key.
//!
//! A fresh key is issued before every handshake, renewed on a fixed interval
//! while the session lives, and revoked on close. A failed renewal (or a
//! `listenKeyExpired` event) forces the session into RECONNECTING instead of
//! waiting for the exchange to drop the socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::network::{Endpoints, MarketFamily};
use crate::websocket::error::{WebSocketError, WsResult};
use crate::websocket::session::{
    ConnectionSession, ConnectionState, SessionConfig, SessionEvent, SessionSender,
};
use crate::websocket::transport::{Connector, Endpoint, TungsteniteConnector};

/// Issues, renews and revokes listen keys.
pub trait ListenKeyProvider: Send + Sync + 'static {
    fn issue(&self) -> BoxFuture<'static, WsResult<String>>;
    fn renew(&self, key: String) -> BoxFuture<'static, WsResult<()>>;
    fn revoke(&self, key: String) -> BoxFuture<'static, WsResult<()>>;
}

/// Keepalive session configuration
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Market family of the user data stream
    pub family: MarketFamily,
    pub endpoints: Endpoints,
    pub session: SessionConfig,
    /// Interval between renewals
    pub renew_interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            family: MarketFamily::Spot,
            endpoints: Endpoints::default(),
            session: SessionConfig::default(),
            renew_interval: Duration::from_secs(30 * 60),
        }
    }
}

type SharedKey = Arc<RwLock<Option<String>>>;

/// Endpoint that issues a new listen key on every resolve.
struct ListenKeyEndpoint {
    family: MarketFamily,
    endpoints: Endpoints,
    provider: Arc<dyn ListenKeyProvider>,
    current_key: SharedKey,
}

impl Endpoint for ListenKeyEndpoint {
    fn resolve(&self) -> BoxFuture<'static, WsResult<String>> {
        let provider = Arc::clone(&self.provider);
        let current_key = Arc::clone(&self.current_key);
        let endpoints = self.endpoints.clone();
        let family = self.family;

        Box::pin(async move {
            let key = provider.issue().await?;
            tracing::info!("Issued {} listen key", family);
            let url = endpoints.raw_stream_url(family, &key);
            *current_key.write() = Some(key);
            Ok(url)
        })
    }
}

/// A [`ConnectionSession`] kept alive by listen key renewal.
pub struct KeepAliveSession {
    session: ConnectionSession,
    provider: Arc<dyn ListenKeyProvider>,
    current_key: SharedKey,
    renew_handle: Option<JoinHandle<()>>,
    forward_handle: Option<JoinHandle<()>>,
}

impl KeepAliveSession {
    /// Spawn with the default connector.
    pub fn start(
        config: KeepAliveConfig,
        provider: Arc<dyn ListenKeyProvider>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        Self::spawn(config, provider, Arc::new(TungsteniteConnector::default()))
    }

    pub fn spawn(
        config: KeepAliveConfig,
        provider: Arc<dyn ListenKeyProvider>,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let current_key: SharedKey = Arc::new(RwLock::new(None));
        let endpoint = Arc::new(ListenKeyEndpoint {
            family: config.family,
            endpoints: config.endpoints.clone(),
            provider: Arc::clone(&provider),
            current_key: Arc::clone(&current_key),
        });

        let capacity = config.session.event_channel_capacity.max(1);
        let (session, inner_rx) = ConnectionSession::spawn(config.session, endpoint, connector);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let renew_handle = tokio::spawn(renew_loop(
            Arc::clone(&provider),
            Arc::clone(&current_key),
            session.sender(),
            session.watch_state(),
            config.renew_interval,
        ));
        let forward_handle = tokio::spawn(forward_events(inner_rx, event_tx, session.sender()));

        (
            Self {
                session,
                provider,
                current_key,
                renew_handle: Some(renew_handle),
                forward_handle: Some(forward_handle),
            },
            event_rx,
        )
    }

    /// Listen key of the current connection
    pub fn current_key(&self) -> Option<String> {
        self.current_key.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    pub fn sender(&self) -> SessionSender {
        self.session.sender()
    }

    pub async fn force_reconnect(&self, reason: impl Into<String>) -> WsResult<()> {
        self.session.force_reconnect(reason).await
    }

    /// Close the session, stop renewing and revoke the key (best effort).
    pub async fn close(&mut self) -> WsResult<()> {
        if let Some(handle) = self.renew_handle.take() {
            handle.abort();
        }
        self.session.close().await?;
        if let Some(handle) = self.forward_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }

        let key = self.current_key.write().take();
        if let Some(key) = key {
            match self.provider.revoke(key).await {
                Ok(()) => tracing::info!("Listen key revoked"),
                Err(e) => tracing::warn!("Failed to revoke listen key: {}", e),
            }
        }
        Ok(())
    }
}

impl Drop for KeepAliveSession {
    fn drop(&mut self) {
        if let Some(handle) = self.renew_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.forward_handle.take() {
            handle.abort();
        }
    }
}

async fn renew_loop(
    provider: Arc<dyn ListenKeyProvider>,
    current_key: SharedKey,
    sender: SessionSender,
    mut state_rx: watch::Receiver<ConnectionState>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.reset();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state_rx.wait_for(|state| state.is_terminal()) => break,
        }

        if sender.state() != ConnectionState::Streaming {
            continue;
        }
        let key = current_key.read().clone();
        let Some(key) = key else {
            continue;
        };

        match provider.renew(key).await {
            Ok(()) => tracing::debug!("Listen key renewed"),
            Err(e) => {
                tracing::warn!("Listen key renewal failed: {}", e);
                if sender
                    .force_reconnect(format!("Listen key renewal failed: {}", e))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Forward session events, reconnecting when the exchange reports the key
/// as expired.
async fn forward_events(
    mut inner_rx: mpsc::Receiver<SessionEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
    sender: SessionSender,
) {
    while let Some(event) = inner_rx.recv().await {
        if let SessionEvent::Frame(text) = &event {
            if is_key_expired(text) {
                tracing::warn!("Listen key expired, reconnecting");
                let _ = sender.force_reconnect("Listen key expired").await;
            }
        }
        if event_tx.send(event).await.is_err() {
            break;
        }
    }
}

fn is_key_expired(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("e").and_then(Value::as_str).map(|e| e == "listenKeyExpired"))
        .unwrap_or(false)
}

#[cfg(feature = "rest")]
pub use rest::RestListenKeyProvider;

#[cfg(feature = "rest")]
mod rest {
    use super::*;
    use reqwest::Method;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ListenKeyResponse {
        listen_key: String,
    }

    /// Listen key provider backed by the exchange REST API.
    ///
    /// Listen key endpoints only need the API key header, no signature.
    #[derive(Debug, Clone)]
    pub struct RestListenKeyProvider {
        client: reqwest::Client,
        family: MarketFamily,
        api_key: String,
        base_url: Option<String>,
    }

    impl RestListenKeyProvider {
        pub fn new(family: MarketFamily, api_key: impl Into<String>) -> WsResult<Self> {
            Ok(Self {
                client: crate::http::build_client(None)?,
                family,
                api_key: api_key.into(),
                base_url: None,
            })
        }

        pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
            self.base_url = Some(base_url.into());
            self
        }

        fn url(&self) -> String {
            let base = self
                .base_url
                .as_deref()
                .unwrap_or_else(|| self.family.api_base_url())
                .trim_end_matches('/');
            format!("{}{}", base, self.family.listen_key_path())
        }

        fn request(&self, method: Method, key: Option<&str>) -> reqwest::RequestBuilder {
            let mut request = self
                .client
                .request(method, self.url())
                .header("X-MBX-APIKEY", &self.api_key);
            if let Some(key) = key {
                request = request.query(&[("listenKey", key)]);
            }
            request
        }
    }

    impl ListenKeyProvider for RestListenKeyProvider {
        fn issue(&self) -> BoxFuture<'static, WsResult<String>> {
            let request = self.request(Method::POST, None);
            Box::pin(async move {
                let response = request.send().await?;
                let body: ListenKeyResponse = crate::http::parse_response(response).await?;
                Ok(body.listen_key)
            })
        }

        fn renew(&self, key: String) -> BoxFuture<'static, WsResult<()>> {
            let request = self.request(Method::PUT, Some(&key));
            Box::pin(async move {
                let response = request.send().await?;
                let _: Value = crate::http::parse_response(response)
                    .await
                    .map_err(|e| WebSocketError::ListenKey(e.to_string()))?;
                Ok(())
            })
        }

        fn revoke(&self, key: String) -> BoxFuture<'static, WsResult<()>> {
            let request = self.request(Method::DELETE, Some(&key));
            Box::pin(async move {
                let response = request.send().await?;
                let _: Value = crate::http::parse_response(response)
                    .await
                    .map_err(|e| WebSocketError::ListenKey(e.to_string()))?;
                Ok(())
            })
        }
    }

}
