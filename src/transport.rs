//! HTTP transport boundary.
//!
//! The executors drive requests through these traits, so the whole request
//! loop can be exercised with scripted transports in tests. The production
//! implementations route through reqwest with one client per proxy, cached
//! in an LRU [`ClientPool`]; each client embeds the proxy URL (credentials
//! percent-encoded in the userinfo component), transport timeouts, the TLS
//! verification toggle, the redirect policy, and connection pool limits.

use crate::client_pool::{ClientPool, DEFAULT_CLIENT_POOL_CAPACITY};
use crate::proxy::Proxy;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// One outbound HTTP attempt.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Per-attempt timeout override; the client default applies otherwise.
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: HeaderMap::new(), body: None, timeout: None }
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub url: String,
}

impl TransportResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Failure classification at the transport boundary.
///
/// The first six kinds are the transient family and are retryable; the rest
/// surface immediately as non-retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Dns,
    Reset,
    TimedOut,
    PoolTimeout,
    Network,
    InvalidRequest,
    Body,
    Decode,
    Other,
}

impl TransportErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::Connect
                | TransportErrorKind::Dns
                | TransportErrorKind::Reset
                | TransportErrorKind::TimedOut
                | TransportErrorKind::PoolTimeout
                | TransportErrorKind::Network
        )
    }
}

/// Transport-level error with its classification attached.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { kind, message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Async transport: one attempt through a specific proxy.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn execute(
        &self,
        proxy: &Proxy,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError>;

    /// Drop any per-proxy client state (the proxy left the pool).
    async fn evict(&self, _proxy_id: Uuid) {}

    /// Release all held clients.
    async fn close(&self) {}
}

/// Blocking transport mirror.
pub trait BlockingTransport: Send + Sync + std::fmt::Debug {
    fn execute(
        &self,
        proxy: &Proxy,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError>;

    fn evict(&self, _proxy_id: Uuid) {}

    fn close(&self) {}
}

/// Per-proxy client construction settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub verify_tls: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub pool_max_idle_per_proxy: usize,
    pub pool_idle_timeout: Option<Duration>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            request_timeout: Duration::from_secs(30),
            verify_tls: true,
            follow_redirects: true,
            max_redirects: 10,
            pool_max_idle_per_proxy: 8,
            pool_idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// Production async transport backed by reqwest.
#[derive(Debug)]
pub struct ReqwestTransport {
    settings: ClientSettings,
    clients: ClientPool<reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_capacity(settings, DEFAULT_CLIENT_POOL_CAPACITY)
    }

    pub fn with_capacity(settings: ClientSettings, client_pool_capacity: usize) -> Self {
        Self { settings, clients: ClientPool::new(client_pool_capacity) }
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    fn build_client(&self, proxy: &Proxy) -> Result<reqwest::Client, TransportError> {
        let upstream = reqwest::Proxy::all(proxy.transport_url()).map_err(|e| {
            TransportError::with_source(
                TransportErrorKind::InvalidRequest,
                format!("invalid proxy URL for {}", proxy.masked_url()),
                e,
            )
        })?;

        let mut builder = reqwest::Client::builder()
            .proxy(upstream)
            .timeout(self.settings.request_timeout)
            .pool_max_idle_per_host(self.settings.pool_max_idle_per_proxy)
            .redirect(redirect_policy(&self.settings));
        if let Some(connect_timeout) = self.settings.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        if let Some(idle) = self.settings.pool_idle_timeout {
            builder = builder.pool_idle_timeout(idle);
        }
        if !self.settings.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(|e| {
            TransportError::with_source(
                TransportErrorKind::InvalidRequest,
                format!("failed to build client for {}", proxy.masked_url()),
                e,
            )
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        proxy: &Proxy,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.clients.get_or_try_create(proxy.id, || self.build_client(proxy))?;

        let mut pending = client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            pending = pending.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            pending = pending.timeout(timeout);
        }

        let response = pending.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().to_string();
        let body = response.bytes().await.map_err(classify_reqwest)?.to_vec();

        Ok(TransportResponse { status, headers, body, url })
    }

    async fn evict(&self, proxy_id: Uuid) {
        self.clients.remove(proxy_id);
    }

    async fn close(&self) {
        let closed = self.clients.clear();
        tracing::debug!(closed, "closed pooled clients");
    }
}

/// Production blocking transport backed by `reqwest::blocking`.
#[derive(Debug)]
pub struct BlockingReqwestTransport {
    settings: ClientSettings,
    clients: ClientPool<reqwest::blocking::Client>,
}

impl BlockingReqwestTransport {
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_capacity(settings, DEFAULT_CLIENT_POOL_CAPACITY)
    }

    pub fn with_capacity(settings: ClientSettings, client_pool_capacity: usize) -> Self {
        Self { settings, clients: ClientPool::new(client_pool_capacity) }
    }

    fn build_client(&self, proxy: &Proxy) -> Result<reqwest::blocking::Client, TransportError> {
        let upstream = reqwest::Proxy::all(proxy.transport_url()).map_err(|e| {
            TransportError::with_source(
                TransportErrorKind::InvalidRequest,
                format!("invalid proxy URL for {}", proxy.masked_url()),
                e,
            )
        })?;

        let mut builder = reqwest::blocking::Client::builder()
            .proxy(upstream)
            .timeout(self.settings.request_timeout)
            .pool_max_idle_per_host(self.settings.pool_max_idle_per_proxy)
            .redirect(redirect_policy(&self.settings));
        if let Some(connect_timeout) = self.settings.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        if let Some(idle) = self.settings.pool_idle_timeout {
            builder = builder.pool_idle_timeout(idle);
        }
        if !self.settings.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(|e| {
            TransportError::with_source(
                TransportErrorKind::InvalidRequest,
                format!("failed to build client for {}", proxy.masked_url()),
                e,
            )
        })
    }
}

impl BlockingTransport for BlockingReqwestTransport {
    fn execute(
        &self,
        proxy: &Proxy,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.clients.get_or_try_create(proxy.id, || self.build_client(proxy))?;

        let mut pending = client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            pending = pending.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            pending = pending.timeout(timeout);
        }

        let response = pending.send().map_err(classify_reqwest)?;
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().to_string();
        let body = response.bytes().map_err(classify_reqwest)?.to_vec();

        Ok(TransportResponse { status, headers, body, url })
    }

    fn evict(&self, proxy_id: Uuid) {
        self.clients.remove(proxy_id);
    }

    fn close(&self) {
        let closed = self.clients.clear();
        tracing::debug!(closed, "closed pooled clients");
    }
}

fn redirect_policy(settings: &ClientSettings) -> reqwest::redirect::Policy {
    if settings.follow_redirects {
        reqwest::redirect::Policy::limited(settings.max_redirects)
    } else {
        reqwest::redirect::Policy::none()
    }
}

fn classify_reqwest(error: reqwest::Error) -> TransportError {
    let kind = reqwest_error_kind(&error);
    let message = error.to_string();
    TransportError { kind, message, source: Some(Box::new(error)) }
}

fn reqwest_error_kind(error: &reqwest::Error) -> TransportErrorKind {
    if error.is_timeout() {
        return TransportErrorKind::TimedOut;
    }
    if error.is_builder() {
        return TransportErrorKind::InvalidRequest;
    }
    if error.is_redirect() {
        return TransportErrorKind::Other;
    }
    if error.is_decode() {
        return TransportErrorKind::Decode;
    }
    if error.is_body() {
        return TransportErrorKind::Body;
    }
    if error.is_connect() {
        return if mentions_dns(error) { TransportErrorKind::Dns } else { TransportErrorKind::Connect };
    }
    match source_io_kind(error) {
        Some(io::ErrorKind::ConnectionRefused) => TransportErrorKind::Connect,
        Some(
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe,
        ) => TransportErrorKind::Reset,
        Some(io::ErrorKind::TimedOut) => TransportErrorKind::TimedOut,
        Some(_) | None => TransportErrorKind::Network,
    }
}

fn mentions_dns(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        let rendered = err.to_string().to_ascii_lowercase();
        if rendered.contains("dns") || rendered.contains("failed to lookup") {
            return true;
        }
        current = err.source();
    }
    false
}

fn source_io_kind(error: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(io_error) = err.downcast_ref::<io::Error>() {
            return Some(io_error.kind());
        }
        current = err.source();
    }
    None
}
