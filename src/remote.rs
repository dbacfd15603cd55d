//! Client for the remote HTTP API.
//!
//! Forwards requests to `<cloud_url>/api/v5`, attaching the configured
//! authorization, and provides the authoritative per-collection document
//! counts the bulk sync works towards.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::collections::CollectionName;
use crate::store::LocalStore;

/// Outcome of a failed forwarded request.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The remote API answered with a non-2xx status.
    #[error("Remote API error: {status} {status_text}")]
    Upstream {
        status: u16,
        status_text: String,
        body: Value,
    },
    /// The request was sent but no response arrived.
    #[error("No response received from remote API: {0}")]
    NoResponse(String),
    /// The request could not be built.
    #[error("Error setting up request to remote API: {0}")]
    Request(String),
    /// The local replica is not running.
    #[error("Local replica is not connected")]
    NotConnected,
}

impl ForwardError {
    /// HTTP status to report to callers of the proxy surface.
    pub fn status_code(&self) -> u16 {
        match self {
            ForwardError::Upstream { status, .. } => *status,
            ForwardError::NoResponse(_) => 504,
            ForwardError::Request(_) => 500,
            ForwardError::NotConnected => 503,
        }
    }

    /// Whether the failure means the remote API could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ForwardError::NoResponse(_) | ForwardError::NotConnected)
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            ForwardError::Request(e.to_string())
        } else {
            ForwardError::NoResponse(e.to_string())
        }
    }
}

/// Source of authoritative document counts.
pub trait RemoteCountProvider: Send + Sync + 'static {
    /// Number of documents in `collection` matching `filter`.
    fn get_count<'a>(
        &'a self,
        filter: &'a str,
        collection: CollectionName,
    ) -> BoxFuture<'a, Result<u64, ForwardError>>;

    /// Whether counts can be requested at all. Checked once before a run.
    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Serialize)]
struct CountRequest<'a> {
    query: &'a str,
    collection: &'a str,
}

/// HTTP client for the remote API.
#[derive(Clone)]
pub struct HttpApiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    replica: Option<Arc<dyn LocalStore>>,
}

impl HttpApiClient {
    /// Creates a client for `base_url` (already including the API prefix).
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
            replica: None,
        })
    }

    /// Refuse to forward while `replica` reports itself disconnected.
    pub fn with_replica(mut self, replica: Arc<dyn LocalStore>) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn is_connected(&self) -> bool {
        self.replica
            .as_ref()
            .map(|replica| replica.is_connected())
            .unwrap_or(true)
    }

    /// Builds the full URL for `endpoint`.
    fn build_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    /// Relays a request to the remote API and returns its JSON body.
    ///
    /// The body is only attached for POST, PUT and PATCH. Extra `headers`
    /// override the defaults.
    pub async fn forward_request(
        &self,
        method: &str,
        endpoint: &str,
        params: &[(String, String)],
        body: Option<&Value>,
        headers: &[(String, String)],
    ) -> Result<Value, ForwardError> {
        if !self.is_connected() {
            return Err(ForwardError::NotConnected);
        }

        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| ForwardError::Request(e.to_string()))?;
        let url = self.build_url(endpoint);

        let mut header_map = HeaderMap::new();
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value =
                HeaderValue::from_str(key).map_err(|e| ForwardError::Request(e.to_string()))?;
            header_map.insert(AUTHORIZATION, value);
        }
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ForwardError::Request(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| ForwardError::Request(e.to_string()))?;
            header_map.insert(name, value);
        }

        let mut request = self.client.request(method.clone(), &url).headers(header_map);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(body) = body {
            if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
                request = request.json(body);
            }
        }

        tracing::debug!(%method, url = %url, "Forwarding request to remote API");

        let response = request.send().await.map_err(|e| {
            let err = ForwardError::from_reqwest(e);
            tracing::error!(url = %url, error = %err, "Error forwarding request to remote API");
            err
        })?;

        let status = response.status();
        let text = response.text().await.map_err(ForwardError::from_reqwest)?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            tracing::warn!(url = %url, status = status.as_u16(), "Remote API returned error status");
            return Err(ForwardError::Upstream {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                body,
            });
        }

        Ok(body)
    }

    /// Raw count response for `collection` filtered by `query`.
    pub async fn get_document_counts(
        &self,
        query: &str,
        collection: &str,
    ) -> Result<Value, ForwardError> {
        let payload = serde_json::to_value(CountRequest { query, collection })
            .map_err(|e| ForwardError::Request(e.to_string()))?;
        self.forward_request("POST", "/store/count", &[], Some(&payload), &[])
            .await
    }
}

impl RemoteCountProvider for HttpApiClient {
    fn get_count<'a>(
        &'a self,
        filter: &'a str,
        collection: CollectionName,
    ) -> BoxFuture<'a, Result<u64, ForwardError>> {
        async move {
            let body = self.get_document_counts(filter, collection.as_str()).await?;
            // A response without a count is treated as an empty collection
            Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0))
        }
        .boxed()
    }

    fn is_available(&self) -> bool {
        self.is_connected()
    }
}
