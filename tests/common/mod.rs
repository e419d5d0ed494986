//! Shared test fixtures: a scriptable transport and proxy helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use whirligig::{
    BlockingTransport, HeaderMap, Proxy, ProxyScheme, StatusCode, Transport, TransportError,
    TransportErrorKind, TransportRequest, TransportResponse,
};

/// One scripted transport step for a proxy.
#[derive(Debug, Clone)]
pub enum Step {
    /// Respond with this status.
    Status(u16),
    /// Fail with this transport error kind.
    Fail(TransportErrorKind, &'static str),
    /// Sleep (async shape only), then respond with this status.
    SlowStatus(Duration, u16),
}

/// Transport whose behavior is scripted per proxy host.
///
/// Steps are consumed in order; once a host's script is exhausted every
/// further attempt answers 200.
#[derive(Debug, Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: AtomicUsize,
    calls_by_host: Mutex<HashMap<String, usize>>,
    evicted: Mutex<Vec<Uuid>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, host: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts.lock().unwrap().insert(host.to_string(), steps.into_iter().collect());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, host: &str) -> usize {
        self.calls_by_host.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub fn evicted(&self) -> Vec<Uuid> {
        self.evicted.lock().unwrap().clone()
    }

    fn next_step(&self, host: &str) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_host.lock().unwrap().entry(host.to_string()).or_insert(0) += 1;
        self.scripts
            .lock()
            .unwrap()
            .get_mut(host)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Status(200))
    }

    fn response(status: u16, url: &str) -> TransportResponse {
        TransportResponse {
            status: StatusCode::from_u16(status).expect("valid status in script"),
            headers: HeaderMap::new(),
            body: b"ok".to_vec(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        proxy: &Proxy,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        match self.next_step(&proxy.host) {
            Step::Status(status) => Ok(Self::response(status, &request.url)),
            Step::Fail(kind, message) => Err(TransportError::new(kind, message)),
            Step::SlowStatus(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(Self::response(status, &request.url))
            }
        }
    }

    async fn evict(&self, proxy_id: Uuid) {
        self.evicted.lock().unwrap().push(proxy_id);
    }
}

impl BlockingTransport for MockTransport {
    fn execute(
        &self,
        proxy: &Proxy,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        match self.next_step(&proxy.host) {
            Step::Status(status) => Ok(Self::response(status, &request.url)),
            Step::Fail(kind, message) => Err(TransportError::new(kind, message)),
            Step::SlowStatus(delay, status) => {
                std::thread::sleep(delay);
                Ok(Self::response(status, &request.url))
            }
        }
    }

    fn evict(&self, proxy_id: Uuid) {
        self.evicted.lock().unwrap().push(proxy_id);
    }
}

pub fn proxy(host: &str) -> Proxy {
    Proxy::new(ProxyScheme::Http, host, 8080)
}

pub fn proxies(hosts: &[&str]) -> Vec<Proxy> {
    hosts.iter().map(|host| proxy(host)).collect()
}
