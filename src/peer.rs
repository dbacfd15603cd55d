//! Websocket link feeding the local replica from peers.
//!
//! Protocol (JSON text frames):
//! 1. Connect to the configured websocket URL
//! 2. Send `hello` with a fresh peer id and the app credentials
//! 3. Send `subscribe` with the replica's active subscription queries, and
//!    again whenever that set changes
//! 4. Apply incoming `upsert` / `remove` messages to the replica
//!
//! The link reconnects after the transport retry interval until shutdown.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::collections::CollectionName;
use crate::config::Config;
use crate::store::{ReplicaStore, StoreError};

/// Errors on the peer link.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Malformed peer message: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Messages exchanged with the peer endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Hello {
        peer_id: String,
        app_id: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_url: Option<String>,
    },
    Subscribe {
        queries: Vec<String>,
    },
    Upsert {
        collection: String,
        id: String,
        value: Value,
    },
    Remove {
        collection: String,
        id: String,
    },
    Error {
        message: String,
    },
}

impl PeerMessage {
    fn encode(&self) -> Result<Message, PeerError> {
        let text = serde_json::to_string(self).map_err(|e| PeerError::Decode(e.to_string()))?;
        Ok(Message::Text(text.into()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PeerError> {
        serde_json::from_slice(bytes).map_err(|e| PeerError::Decode(e.to_string()))
    }
}

/// Keeps the replica connected to its peers.
pub struct PeerLink {
    websocket_url: String,
    app_id: String,
    token: String,
    auth_url: Option<String>,
    retry_interval: Duration,
    store: ReplicaStore,
    peer_id: String,
}

impl PeerLink {
    pub fn new(
        websocket_url: impl Into<String>,
        app_id: impl Into<String>,
        token: impl Into<String>,
        retry_interval: Duration,
        store: ReplicaStore,
    ) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            app_id: app_id.into(),
            token: token.into(),
            auth_url: None,
            retry_interval,
            store,
            peer_id: Uuid::new_v4().to_string(),
        }
    }

    /// Builds a link from config. Returns `None` when no websocket URL is set.
    pub fn from_config(config: &Config, store: ReplicaStore) -> Option<Self> {
        let url = config.websocket_url.as_ref()?;
        let mut link = Self::new(
            url.clone(),
            config.app_id.clone(),
            config.playground_token.clone(),
            config.transport_retry_interval(),
            store,
        );
        link.auth_url = config.auth_url.clone();
        Some(link)
    }

    /// Runs the link until `shutdown_rx` turns `true`.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(url = %self.websocket_url, peer_id = %self.peer_id, "Starting peer link");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.session(&mut shutdown_rx).await {
                Ok(()) => tracing::info!("Peer connection closed"),
                Err(e) => tracing::warn!(error = %e, "Peer connection failed"),
            }

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                _ = tokio::time::sleep(self.retry_interval) => {
                    tracing::debug!(
                        "Reconnecting to peers after {}ms",
                        self.retry_interval.as_millis()
                    );
                }
            }
        }

        tracing::info!("Peer link stopped");
    }

    /// One connection, from handshake until close, error or shutdown.
    async fn session(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<(), PeerError> {
        let ws_url = self.build_ws_url();
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| PeerError::Connect(e.to_string()))?;
        let (mut sender, mut receiver) = ws_stream.split();

        let hello = PeerMessage::Hello {
            peer_id: self.peer_id.clone(),
            app_id: self.app_id.clone(),
            token: self.token.clone(),
            auth_url: self.auth_url.clone(),
        };
        sender
            .send(hello.encode()?)
            .await
            .map_err(|e| PeerError::WebSocket(e.to_string()))?;

        let mut subscriptions_rx = self.store.subscriptions_receiver();
        let _ = subscriptions_rx.borrow_and_update();
        sender
            .send(self.subscribe_message().encode()?)
            .await
            .map_err(|e| PeerError::WebSocket(e.to_string()))?;

        tracing::info!("Peer connection established");

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown_rx) => {
                    let _ = sender.send(Message::Close(None)).await;
                    return Ok(());
                }
                changed = subscriptions_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let _ = subscriptions_rx.borrow_and_update();
                    sender
                        .send(self.subscribe_message().encode()?)
                        .await
                        .map_err(|e| PeerError::WebSocket(e.to_string()))?;
                }
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.apply(text.as_bytes()).await,
                    Some(Ok(Message::Binary(data))) => self.apply(&data).await,
                    Some(Ok(Message::Ping(data))) => {
                        sender
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| PeerError::WebSocket(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(PeerError::WebSocket(e.to_string())),
                },
            }
        }
    }

    fn subscribe_message(&self) -> PeerMessage {
        PeerMessage::Subscribe {
            queries: self.store.active_subscriptions(),
        }
    }

    /// Applies one incoming frame, logging anything that cannot be applied.
    async fn apply(&self, bytes: &[u8]) {
        if let Err(e) = self.handle_message(bytes).await {
            tracing::warn!(error = %e, "Failed to apply peer message");
        }
    }

    async fn handle_message(&self, bytes: &[u8]) -> Result<(), PeerError> {
        match PeerMessage::decode(bytes)? {
            PeerMessage::Upsert {
                collection,
                id,
                value,
            } => match CollectionName::parse(&collection) {
                Some(collection) => self.store.upsert(collection, &id, &value).await?,
                None => tracing::warn!(collection = %collection, "Ignoring document for unknown collection"),
            },
            PeerMessage::Remove { collection, id } => match CollectionName::parse(&collection) {
                Some(collection) => {
                    self.store.remove(collection, &id).await?;
                }
                None => tracing::warn!(collection = %collection, "Ignoring removal for unknown collection"),
            },
            PeerMessage::Error { message } => {
                tracing::error!(message = %message, "Peer reported error");
            }
            other => {
                tracing::debug!(?other, "Ignoring unexpected peer message");
            }
        }
        Ok(())
    }

    /// Builds the websocket URL, converting http(s) schemes to ws(s).
    ///
    /// A URL without a path gets `/` before the query string.
    fn build_ws_url(&self) -> String {
        let url = self.websocket_url.as_str();
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("http://") {
            ("ws", rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            ("wss", rest)
        } else if let Some(rest) = url.strip_prefix("ws://") {
            ("ws", rest)
        } else if let Some(rest) = url.strip_prefix("wss://") {
            ("wss", rest)
        } else {
            ("ws", url)
        };

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let mut ws_url = format!("{}://{}", scheme, location);
        let mut params: Vec<String> = query
            .filter(|q| !q.is_empty())
            .map(|q| vec![q.to_string()])
            .unwrap_or_default();
        if !self.app_id.is_empty() {
            params.push(format!("app_id={}", urlencoding::encode(&self.app_id)));
        }

        if !params.is_empty() {
            if !location.contains('/') {
                ws_url.push('/');
            }
            ws_url.push('?');
            ws_url.push_str(&params.join("&"));
        }
        ws_url
    }
}

/// Resolves once `shutdown_rx` turns `true`, or its sender is gone.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}
