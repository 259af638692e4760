//! HTTP forwarding to worker-hosted HTTP servers.
//!
//! Some workers expose an HTTP endpoint instead of handling invocations over
//! the event stream. [`HttpForwarder`] proxies a request to that endpoint
//! over HTTP/1.1 and [`RetryingForwarder`] wraps any forwarder with the
//! retry policy, retrying only connection failures and timeouts.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::backoff::RetryPolicy;

/// Forwarding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("invalid forward url: {0}")]
    InvalidUrl(String),

    #[error("unsupported forward scheme: {0}")]
    UnsupportedScheme(String),

    #[error("failed to build request: {0}")]
    RequestBuild(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("forwarded request timed out")]
    Timeout,

    #[error("backend error: {0}")]
    Backend(String),
}

impl ForwardError {
    /// Connection failures and timeouts may clear on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout)
    }
}

/// A request to forward.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path and query, appended to the forwarder's base url.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Response from the forwarded endpoint.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Forwards HTTP requests.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError>;
}

/// HTTP/1.1 forwarder, one connection per request.
#[derive(Debug, Clone)]
#[must_use]
pub struct HttpForwarder {
    base_url: String,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Splits the base url into `host:port` and a path prefix.
    ///
    /// Only plain `http` is spoken; any other scheme is refused rather than
    /// sent unencrypted.
    fn target(&self) -> Result<(String, String), ForwardError> {
        let uri: hyper::Uri = self
            .base_url
            .parse()
            .map_err(|e| ForwardError::InvalidUrl(format!("{e}")))?;
        match uri.scheme_str() {
            Some("http") | None => {}
            Some(other) => return Err(ForwardError::UnsupportedScheme(other.to_owned())),
        }
        let host = uri
            .host()
            .ok_or_else(|| ForwardError::InvalidUrl("missing host".into()))?;
        let port = uri.port_u16().unwrap_or(80);
        let prefix = uri.path().trim_end_matches('/').to_owned();
        Ok((format!("{host}:{port}"), prefix))
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let (authority, prefix) = self.target()?;
        let path = format!("{prefix}/{}", request.path.trim_start_matches('/'));

        let mut builder = Request::builder()
            .method(request.method)
            .uri(&path)
            .header(hyper::header::HOST, &authority);
        for (name, value) in &request.headers {
            if *name != hyper::header::HOST {
                builder = builder.header(name, value);
            }
        }
        let outgoing = builder
            .body(Full::new(request.body))
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&authority))
            .await
            .map_err(|_| ForwardError::Timeout)?
            .map_err(|e| ForwardError::Connect(e.to_string()))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ForwardError::Connect(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Forward connection closed with error");
            }
        });

        let response = tokio::time::timeout(self.timeout, sender.send_request(outgoing))
            .await
            .map_err(|_| ForwardError::Timeout)?
            .map_err(|e| ForwardError::Backend(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .collect()
            .await
            .map_err(|e| ForwardError::Backend(e.to_string()))?
            .to_bytes();

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }
}

/// Retries transient forwarding failures.
#[derive(Debug, Clone)]
pub struct RetryingForwarder<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: Forwarder> RetryingForwarder<F> {
    pub const fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<F: Forwarder> Forwarder for RetryingForwarder<F> {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let inner = &self.inner;
        let outgoing = &request;
        let result = self
            .policy
            .retry(
                "forward",
                move |_| inner.forward(outgoing.clone()),
                ForwardError::is_transient,
            )
            .await;
        if let Err(e) = &result {
            warn!(path = %request.path, error = %e, "Forwarded request failed");
        }
        result
    }
}
