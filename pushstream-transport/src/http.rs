//! HTTP-backed [`Transport`] implementation.
//!
//! `HttpTransport` turns the engine's fire-and-forget issue path into real
//! HTTP calls: every request is spawned onto the runtime, and its completion
//! is sent into the host's reply channel as a [`TransportReply`]. The actual
//! wire call sits behind the [`HttpBackend`] trait so tests can substitute a
//! scripted backend without touching the network.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{HttpError, ServerError, TransportFailure};
use crate::{HttpMethod, Transport, TransportReply, TransportRequest};

/// Raw HTTP response before it is mapped into a reply envelope.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
}

/// Minimal async HTTP seam.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, HttpError>;
}

/// reqwest-based backend sharing one client and connection pool.
#[derive(Debug, Clone, Default)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, HttpError> {
        let mut builder = match method {
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Delete => self.client.delete(url),
            HttpMethod::Patch => self.client.patch(url),
        };
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HttpError(e.to_string()))?;
        let status = response.status().as_u16();
        // Empty and non-JSON bodies are fine: DELETE typically returns nothing.
        let body = response.json::<Value>().await.ok();
        Ok(HttpResponse { status, body })
    }
}

/// [`Transport`] implementation that spawns each request and routes the
/// completion into the host's reply channel.
pub struct HttpTransport {
    backend: Arc<dyn HttpBackend>,
    base_url: String,
    replies: mpsc::UnboundedSender<TransportReply>,
}

impl HttpTransport {
    /// Create a transport against `base_url` delivering replies to `replies`.
    pub fn new(base_url: impl Into<String>, replies: mpsc::UnboundedSender<TransportReply>) -> Self {
        Self::with_backend(Arc::new(ReqwestBackend::new()), base_url, replies)
    }

    /// Create a transport with a custom backend (used by tests).
    pub fn with_backend(
        backend: Arc<dyn HttpBackend>,
        base_url: impl Into<String>,
        replies: mpsc::UnboundedSender<TransportReply>,
    ) -> Self {
        Self {
            backend,
            base_url: base_url.into(),
            replies,
        }
    }

    fn dispatch(&self, method: HttpMethod, request: TransportRequest) {
        let backend = Arc::clone(&self.backend);
        let replies = self.replies.clone();
        let url = format!("{}{}", self.base_url, request.url());
        let TransportRequest {
            body,
            headers,
            handle,
            ..
        } = request;

        tokio::spawn(async move {
            let outcome = backend.execute(method, &url, body.as_ref(), &headers).await;
            let result = match outcome {
                Ok(response) if (200..300).contains(&response.status) => {
                    Ok(response.body.unwrap_or(Value::Null))
                }
                Ok(response) => {
                    let error = response
                        .body
                        .and_then(|body| serde_json::from_value::<ServerError>(body).ok());
                    Err(TransportFailure::server(response.status, error))
                }
                Err(HttpError(reason)) => {
                    debug!(%url, %reason, "request failed before a response was received");
                    Err(TransportFailure::network())
                }
            };
            if replies.send(TransportReply { handle, result }).is_err() {
                debug!(%url, "reply channel closed; dropping response");
            }
        });
    }
}

impl Transport for HttpTransport {
    fn post(&self, request: TransportRequest) {
        self.dispatch(HttpMethod::Post, request);
    }

    fn delete(&self, request: TransportRequest) {
        self.dispatch(HttpMethod::Delete, request);
    }

    fn patch(&self, request: TransportRequest) {
        self.dispatch(HttpMethod::Patch, request);
    }
}
