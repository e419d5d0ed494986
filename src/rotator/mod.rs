//! Async rotation façade: verb helpers, selection, retry, lifecycle.

mod builder;

pub use builder::{RotatorBuilder, RotatorConfig};

use crate::breaker::{AsyncCircuitBreaker, BreakerRegistry, BreakerState, BreakerTransition};
use crate::clock::Clock;
use crate::error::RotatorError;
use crate::limiter::{QueueStats, RateLimiter, RequestQueue};
use crate::metrics::MetricsCollector;
use crate::pool::{PoolStats, ProxyPool};
use crate::proxy::{Proxy, ProxyChain};
use crate::retry::{AlternateSelector, RetryExecutor, RetryPolicy};
use crate::sleeper::Sleeper;
use crate::storage::{ProxyRecord, Storage};
use crate::strategy::{RotationStrategy, SelectionContext, StrategyKind};
use crate::transport::{Transport, TransportRequest, TransportResponse};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub(crate) type BootstrapHook = Box<dyn Fn() -> BoxFuture<'static, Vec<Proxy>> + Send + Sync>;

pub(crate) struct BootstrapState {
    pub(crate) hook: Option<BootstrapHook>,
    pub(crate) attempted: bool,
    pub(crate) error: Option<String>,
}

pub(crate) struct AggregationWorker {
    pub(crate) handle: JoinHandle<()>,
    pub(crate) shutdown: tokio::sync::watch::Sender<bool>,
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Per-request retry policy override.
    pub policy: Option<RetryPolicy>,
    /// Request id for attempt correlation; generated when absent.
    pub request_id: Option<Uuid>,
    /// Session stickiness key (session strategy).
    pub session_key: Option<String>,
    /// Region hint (geo and performance strategies).
    pub target_region: Option<String>,
    /// Per-attempt transport timeout override.
    pub attempt_timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn target_region(mut self, region: impl Into<String>) -> Self {
        self.target_region = Some(region.into());
        self
    }
}

/// Pool statistics plus the per-source breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    #[serde(flatten)]
    pub pool: PoolStats,
    pub source_breakdown: BTreeMap<String, usize>,
}

struct QueuedRequest {
    method: Method,
    url: String,
    options: RequestOptions,
    proxy: Proxy,
}

/// The rotation façade.
///
/// Owns the pool, the hot-swappable strategy, the per-proxy breakers and
/// clients, the retry policy, the metrics collector, and the background
/// aggregation worker. Construct with [`Rotator::builder`]; call
/// [`close`](Rotator::close) on the way out (dropping without closing
/// aborts the worker but skips the graceful client shutdown).
pub struct Rotator {
    pub(crate) pool: Arc<ProxyPool>,
    pub(crate) strategy: ArcSwap<Box<dyn RotationStrategy>>,
    pub(crate) breakers: Arc<BreakerRegistry<AsyncCircuitBreaker>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) policy: RetryPolicy,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) limiter: Option<Arc<dyn RateLimiter>>,
    pub(crate) queue: Option<RequestQueue<QueuedRequest>>,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) chains: Mutex<Vec<ProxyChain>>,
    pub(crate) bootstrap: tokio::sync::Mutex<BootstrapState>,
    pub(crate) config: RotatorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) worker: Mutex<Option<AggregationWorker>>,
}

impl std::fmt::Debug for Rotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rotator")
            .field("pool_size", &self.pool.size())
            .field("strategy", &self.strategy.load().name())
            .finish()
    }
}

impl Rotator {
    pub fn builder() -> RotatorBuilder {
        RotatorBuilder::new()
    }

    // ---- pool management ----

    /// Add a proxy: pool entry, fresh closed breaker, storage upsert.
    /// Returns false if the id is already present.
    pub async fn add_proxy(&self, proxy: Proxy) -> bool {
        let id = proxy.id;
        let masked = proxy.masked_url();
        let record = ProxyRecord::from(&proxy);
        if !self.pool.add(proxy) {
            return false;
        }
        let breaker = AsyncCircuitBreaker::with_config(id, self.config.breaker)
            .with_clock(Arc::clone(&self.clock));
        self.breakers.register(id, Arc::new(breaker));
        tracing::info!(proxy_id = %id, proxy = %masked, "added proxy to pool");

        if let Some(storage) = &self.storage {
            if let Err(error) = storage.save_proxies(std::slice::from_ref(&record)).await {
                tracing::warn!(proxy_id = %id, %error, "proxy save failed");
            }
        }
        true
    }

    /// Parse a URL and add it. Returns the new proxy id.
    pub async fn add_proxy_url(&self, url: &str) -> Result<Uuid, RotatorError> {
        let proxy = Proxy::parse(url)?;
        let id = proxy.id;
        self.add_proxy(proxy).await;
        Ok(id)
    }

    /// Remove a proxy along with its breaker and pooled client.
    pub async fn remove_proxy(&self, id: Uuid) -> Option<Proxy> {
        self.transport.evict(id).await;
        self.breakers.remove(id);
        let removed = self.pool.remove(id)?;
        tracing::info!(proxy_id = %id, "removed proxy from pool");

        if let Some(storage) = &self.storage {
            if let Err(error) = storage.delete_proxy(&removed.endpoint()).await {
                tracing::warn!(proxy_id = %id, %error, "proxy delete failed");
            }
        }
        Some(removed)
    }

    /// Register a proxy chain; its entry hop joins the pool.
    pub async fn add_chain(&self, chain: ProxyChain) {
        let entry = chain.tagged_entry();
        tracing::info!(
            chain = chain.name.as_deref().unwrap_or("unnamed"),
            hops = chain.len(),
            entry = %entry.masked_url(),
            "registered proxy chain"
        );
        self.add_proxy(entry).await;
        self.chains.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(chain);
    }

    pub fn chains(&self) -> Vec<ProxyChain> {
        self.chains.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Remove a chain by name (and its entry proxy). Returns false when no
    /// chain carries the name.
    pub async fn remove_chain(&self, name: &str) -> bool {
        let chain = {
            let mut chains = self.chains.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let index = chains.iter().position(|c| c.name.as_deref() == Some(name));
            match index {
                Some(index) => chains.remove(index),
                None => {
                    tracing::warn!(chain = name, "chain not found");
                    return false;
                }
            }
        };
        self.remove_proxy(chain.entry_proxy().id).await;
        tracing::info!(chain = name, "removed proxy chain");
        true
    }

    /// Drop every unhealthy or dead proxy, with its breaker and client.
    pub async fn clear_unhealthy(&self) -> usize {
        let removed = self.pool.clear_unhealthy();
        for id in &removed {
            self.breakers.remove(*id);
            self.transport.evict(*id).await;
        }
        removed.len()
    }

    /// Point-in-time copy of the pool.
    pub fn proxies(&self) -> Vec<Proxy> {
        self.pool.snapshot()
    }

    // ---- strategy ----

    /// Hot-swap the rotation strategy. Takes effect for the next selection;
    /// in-flight requests finish under the strategy they started with.
    pub fn set_strategy(&self, strategy: Box<dyn RotationStrategy>) {
        let start = Instant::now();
        let old = self.strategy.load().name();
        let new = strategy.name();
        self.strategy.store(Arc::new(strategy));
        let swap_ms = start.elapsed().as_secs_f64() * 1_000.0;

        tracing::info!(old_strategy = old, new_strategy = new, swap_ms, "strategy hot-swapped");
        if swap_ms >= 100.0 {
            tracing::warn!(swap_ms, "strategy swap exceeded the 100ms target");
        }
    }

    pub fn set_strategy_name(&self, name: &str) -> Result<(), RotatorError> {
        let kind: StrategyKind = name.parse()?;
        self.set_strategy(kind.build());
        Ok(())
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.load().name()
    }

    // ---- requests ----

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<TransportResponse, RotatorError> {
        self.ensure_bootstrap().await?;

        let proxy = self
            .select_proxy(
                None,
                options.session_key.as_deref(),
                options.target_region.as_deref(),
            )
            .await?;

        if let Some(limiter) = &self.limiter {
            if !limiter.check(proxy.id) {
                tracing::warn!(
                    proxy_id = %proxy.id,
                    proxy = %proxy.masked_url(),
                    "rate limit exceeded for proxy"
                );
                if let Some(queue) = &self.queue {
                    queue.push(QueuedRequest {
                        method,
                        url: url.to_string(),
                        options,
                        proxy,
                    })?;
                    return self.process_queued().await;
                }
                return Err(RotatorError::connection(
                    format!("rate limit exceeded for proxy {}", proxy.id),
                    None,
                ));
            }
        }

        self.dispatch(method, url, options, proxy).await
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::GET, url, options).await
    }

    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::POST, url, options).await
    }

    pub async fn put(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::PUT, url, options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::DELETE, url, options).await
    }

    pub async fn patch(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::PATCH, url, options).await
    }

    pub async fn head(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::HEAD, url, options).await
    }

    pub async fn options(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::OPTIONS, url, options).await
    }

    /// Selection helper: the proxy the rotator would use right now.
    pub async fn get_proxy(&self) -> Result<Proxy, RotatorError> {
        self.select_proxy(None, None, None).await
    }

    // ---- inspection ----

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn statistics(&self) -> Statistics {
        let source_breakdown = self
            .pool
            .source_breakdown()
            .into_iter()
            .map(|(source, count)| (source.as_str().to_string(), count))
            .collect();
        Statistics { pool: self.pool.stats(), source_breakdown }
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub async fn circuit_breaker_states(&self) -> BTreeMap<Uuid, BreakerState> {
        let mut states = BTreeMap::new();
        for (id, breaker) in self.breakers.entries() {
            states.insert(id, breaker.state().await);
        }
        states
    }

    /// Manually force a breaker back to closed.
    pub async fn reset_circuit_breaker(&self, id: Uuid) -> Result<(), RotatorError> {
        let breaker = self.breakers.get(id).ok_or_else(|| {
            RotatorError::invalid_config(format!("no circuit breaker for proxy {id}"))
        })?;
        let transition = breaker.reset().await;
        self.publish_transition(&breaker, transition).await;
        tracing::info!(proxy_id = %id, "circuit breaker manually reset");
        Ok(())
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.as_ref().map(|q| q.stats()).unwrap_or_else(QueueStats::disabled)
    }

    /// Discard queued requests. Errors when queueing is disabled.
    pub fn clear_queue(&self) -> Result<usize, RotatorError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| RotatorError::invalid_config("request queue is not enabled"))?;
        let cleared = queue.clear();
        tracing::info!(cleared, "cleared request queue");
        Ok(cleared)
    }

    // ---- lifecycle ----

    /// Stop the aggregation worker and release all pooled clients.
    pub async fn close(&self) {
        let worker = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            let _ = worker.handle.await;
        }
        self.transport.close().await;
        tracing::debug!("rotator closed");
    }

    // ---- internals ----

    /// Selection core: snapshot, drop expired, drop refused admissions,
    /// then hand the survivors to the current strategy.
    pub(crate) async fn select_proxy(
        &self,
        exclude: Option<Uuid>,
        session_key: Option<&str>,
        target_region: Option<&str>,
    ) -> Result<Proxy, RotatorError> {
        let snapshot = self.pool.snapshot();
        if snapshot.is_empty() {
            return Err(RotatorError::no_proxies_configured());
        }
        let total = snapshot.len();
        let now = self.clock.now_utc();

        let mut expired = 0usize;
        let mut admitted = Vec::with_capacity(total);
        for proxy in snapshot {
            if proxy.is_expired(now) {
                expired += 1;
                continue;
            }
            if exclude.is_some_and(|id| id == proxy.id) {
                continue;
            }
            let allowed = match self.breakers.get(proxy.id) {
                Some(breaker) => {
                    let admission = breaker.should_attempt().await;
                    self.publish_transition(&breaker, admission.transition).await;
                    admission.allowed
                }
                None => true,
            };
            if allowed {
                admitted.push(proxy);
            }
        }

        if expired > 0 {
            tracing::debug!(expired, "skipped expired proxies during selection");
        }
        if admitted.is_empty() {
            if expired == total {
                return Err(RotatorError::all_proxies_expired());
            }
            tracing::error!("no proxy admitted: breakers open or proxies expired");
            return Err(RotatorError::all_proxies_failing());
        }

        let ctx = SelectionContext { session_key, target_region };
        let strategy = self.strategy.load();
        strategy
            .select(&admitted, &ctx)
            .cloned()
            .ok_or_else(RotatorError::all_proxies_failing)
    }

    async fn dispatch(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        proxy: Proxy,
    ) -> Result<TransportResponse, RotatorError> {
        let request_id = options.request_id.unwrap_or_else(Uuid::new_v4);
        let effective_policy = options.policy.clone().unwrap_or_else(|| self.policy.clone());
        tracing::info!(
            %method,
            url,
            proxy_id = %proxy.id,
            proxy = %proxy.masked_url(),
            %request_id,
            "dispatching request"
        );

        let mut transport_request = TransportRequest::new(method.clone(), url);
        transport_request.headers = options.headers.clone();
        transport_request.body = options.body.clone();
        transport_request.timeout = options.attempt_timeout;
        let transport_request = Arc::new(transport_request);

        let mut executor = RetryExecutor::new(
            effective_policy.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.breakers),
            Arc::clone(&self.metrics),
        )
        .with_sleeper(Arc::clone(&self.sleeper))
        .with_clock(Arc::clone(&self.clock));
        if let Some(storage) = &self.storage {
            executor = executor.with_storage(Arc::clone(storage));
        }

        let transport = Arc::clone(&self.transport);
        let attempt_request = Arc::clone(&transport_request);
        let attempt_fn = move |proxy: Proxy| {
            let transport = Arc::clone(&transport);
            let request = Arc::clone(&attempt_request);
            async move { transport.execute(&proxy, &request).await }
        };

        let selector = RotatorSelector {
            rotator: self,
            session_key: options.session_key.clone(),
            target_region: options.target_region.clone(),
        };

        let started = Instant::now();
        let initial = proxy.clone();
        match executor.execute(request_id, &method, proxy, attempt_fn, &selector).await {
            Ok(success) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                let status = success.response.status.as_u16();
                // A raw retryable status handed back on the single-shot
                // path still counts against the proxy.
                let proxy_ok = !effective_policy.is_retryable_status(status);
                self.strategy.load().record_result(&success.proxy, proxy_ok, elapsed_ms);
                tracing::info!(
                    %method,
                    url,
                    status,
                    attempts = success.attempts,
                    elapsed_ms,
                    "request completed"
                );
                Ok(success.response)
            }
            Err(error) => {
                self.strategy.load().record_result(&initial, false, 0.0);
                match &error {
                    RotatorError::Authentication { status, .. } => {
                        tracing::error!(proxy_id = %initial.id, status, "proxy authentication failed");
                    }
                    _ => {
                        tracing::warn!(%method, url, %error, "request failed after retries");
                    }
                }
                Err(error)
            }
        }
    }

    async fn process_queued(&self) -> Result<TransportResponse, RotatorError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| RotatorError::invalid_config("request queue is not enabled"))?;
        let queued = queue
            .pop()
            .ok_or_else(|| RotatorError::connection("no queued request to process", None))?;
        tracing::info!(
            method = %queued.method,
            url = queued.url,
            remaining = queue.len(),
            "processing queued request"
        );
        self.dispatch(queued.method, &queued.url, queued.options, queued.proxy).await
    }

    async fn ensure_bootstrap(&self) -> Result<(), RotatorError> {
        if !self.pool.is_empty() {
            return Ok(());
        }

        let mut state = self.bootstrap.lock().await;
        if !self.pool.is_empty() {
            return Ok(());
        }
        if let Some(message) = &state.error {
            return Err(RotatorError::PoolEmpty { reason: message.clone() });
        }
        if state.attempted {
            return Ok(());
        }
        state.attempted = true;
        let Some(hook) = &state.hook else {
            return Ok(());
        };

        tracing::info!("pool empty on request, invoking bootstrap hook");
        let proxies = hook().await;
        if proxies.is_empty() {
            let message =
                "proxy pool is empty - bootstrap yielded no proxies and will not be retried"
                    .to_string();
            state.error = Some(message.clone());
            tracing::error!("bootstrap yielded no proxies");
            return Err(RotatorError::PoolEmpty { reason: message });
        }

        let count = proxies.len();
        for proxy in proxies {
            self.add_proxy(proxy).await;
        }
        tracing::info!(count, "bootstrap populated the pool");
        Ok(())
    }

    async fn publish_transition(
        &self,
        breaker: &Arc<AsyncCircuitBreaker>,
        transition: Option<BreakerTransition>,
    ) {
        let Some(transition) = transition else {
            return;
        };
        tracing::info!(
            proxy_id = %transition.proxy_id,
            from = %transition.from,
            to = %transition.to,
            "circuit breaker transitioned"
        );
        self.metrics.record_breaker_event(transition.clone());
        if let Some(storage) = &self.storage {
            let snapshot = breaker.snapshot().await;
            if let Err(error) = storage.save_breaker_state(transition.proxy_id, &snapshot).await {
                tracing::warn!(proxy_id = %transition.proxy_id, %error, "breaker snapshot save failed");
            }
        }
    }
}

impl Drop for Rotator {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                worker.handle.abort();
            }
        }
    }
}

struct RotatorSelector<'a> {
    rotator: &'a Rotator,
    session_key: Option<String>,
    target_region: Option<String>,
}

#[async_trait]
impl AlternateSelector for RotatorSelector<'_> {
    async fn select_alternate(&self, exclude: Uuid) -> Option<Proxy> {
        self.rotator
            .select_proxy(Some(exclude), self.session_key.as_deref(), self.target_region.as_deref())
            .await
            .ok()
    }
}
