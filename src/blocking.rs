//! Blocking rotation façade.
//!
//! Mirrors the async [`Rotator`](crate::Rotator) contract over
//! `reqwest::blocking`, the sync circuit breakers, and a thread-based
//! aggregation worker. Do not use it from inside an async runtime; that is
//! what the async shape is for.

use crate::breaker::{BreakerRegistry, BreakerState, BreakerTransition, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::error::RotatorError;
use crate::limiter::{QueueStats, RateLimiter, RequestQueue};
use crate::metrics::MetricsCollector;
use crate::pool::{PoolStats, ProxyPool};
use crate::proxy::{Proxy, ProxyChain};
use crate::retry::{
    BlockingAlternateSelector, BlockingRetryExecutor, RetryPolicy,
};
use crate::rotator::{RequestOptions, RotatorConfig, Statistics};
use crate::sleeper::{BlockingSleeper, ThreadSleeper};
use crate::strategy::{RotationStrategy, RoundRobinStrategy, SelectionContext, StrategyKind};
use crate::transport::{
    BlockingReqwestTransport, BlockingTransport, TransportRequest, TransportResponse,
};
use arc_swap::ArcSwap;
use reqwest::Method;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

type BlockingBootstrapHook = Box<dyn Fn() -> Vec<Proxy> + Send + Sync>;

struct BootstrapState {
    hook: Option<BlockingBootstrapHook>,
    attempted: bool,
    error: Option<String>,
}

struct QueuedRequest {
    method: Method,
    url: String,
    options: RequestOptions,
    proxy: Proxy,
}

struct AggregationWorker {
    handle: Option<std::thread::JoinHandle<()>>,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
}

impl AggregationWorker {
    fn spawn(metrics: Arc<MetricsCollector>, interval: Duration) -> Self {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("whirligig-aggregation".to_string())
            .spawn(move || {
                let (lock, cvar) = &*flag;
                let mut stop = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                loop {
                    let (guard, wait) = cvar
                        .wait_timeout(stop, interval)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    stop = guard;
                    if *stop {
                        break;
                    }
                    if wait.timed_out() {
                        metrics.aggregate_hourly();
                    }
                }
                tracing::debug!("aggregation worker stopped");
            })
            .expect("failed to spawn aggregation worker thread");
        Self { handle: Some(handle), shutdown }
    }

    fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.shutdown;
            let mut stop = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *stop = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Builder for the blocking rotator.
pub struct RotatorBuilder {
    proxies: Vec<Proxy>,
    strategy: Option<Box<dyn RotationStrategy>>,
    policy: RetryPolicy,
    config: RotatorConfig,
    limiter: Option<Arc<dyn RateLimiter>>,
    transport: Option<Arc<dyn BlockingTransport>>,
    bootstrap: Option<BlockingBootstrapHook>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn BlockingSleeper>,
}

impl Default for RotatorBuilder {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            strategy: None,
            policy: RetryPolicy::default(),
            config: RotatorConfig::default(),
            limiter: None,
            transport: None,
            bootstrap: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(ThreadSleeper),
        }
    }
}

impl RotatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxies.push(proxy);
        self
    }

    pub fn proxies(mut self, proxies: impl IntoIterator<Item = Proxy>) -> Self {
        self.proxies.extend(proxies);
        self
    }

    pub fn proxy_url(mut self, url: &str) -> Result<Self, RotatorError> {
        self.proxies.push(Proxy::parse(url)?);
        Ok(self)
    }

    pub fn strategy(mut self, strategy: Box<dyn RotationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn strategy_kind(mut self, kind: StrategyKind) -> Self {
        self.strategy = Some(kind.build());
        self
    }

    pub fn strategy_name(mut self, name: &str) -> Result<Self, RotatorError> {
        let kind: StrategyKind = name.parse()?;
        self.strategy = Some(kind.build());
        Ok(self)
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(mut self, config: RotatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BlockingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// One-shot hook invoked when the pool is empty on first request.
    pub fn bootstrap<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Vec<Proxy> + Send + Sync + 'static,
    {
        self.bootstrap = Some(Box::new(hook));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn BlockingSleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Result<Rotator, RotatorError> {
        let alpha = self.config.pool.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(RotatorError::invalid_config(format!(
                "ema_alpha must be in (0, 1] (got {alpha})"
            )));
        }

        let pool = Arc::new(ProxyPool::new(self.config.pool).with_clock(Arc::clone(&self.clock)));
        let breakers = Arc::new(BreakerRegistry::new());
        for proxy in self.proxies {
            let id = proxy.id;
            if pool.add(proxy) {
                let breaker = CircuitBreaker::with_config(id, self.config.breaker)
                    .with_clock(Arc::clone(&self.clock));
                breakers.register(id, Arc::new(breaker));
            }
        }

        let transport: Arc<dyn BlockingTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(BlockingReqwestTransport::with_capacity(
                self.config.client.clone(),
                self.config.client_pool_capacity,
            )),
        };

        let metrics = Arc::new(
            MetricsCollector::new(self.config.metrics).with_clock(Arc::clone(&self.clock)),
        );
        let strategy: Box<dyn RotationStrategy> =
            self.strategy.unwrap_or_else(|| Box::new(RoundRobinStrategy::new()));

        let queue = self.config.queue_enabled.then(|| {
            tracing::info!(capacity = self.config.queue_capacity, "request queueing enabled");
            RequestQueue::new(self.config.queue_capacity)
        });

        let worker = AggregationWorker::spawn(Arc::clone(&metrics), self.config.aggregation_interval);

        Ok(Rotator {
            pool,
            strategy: ArcSwap::from_pointee(strategy),
            breakers,
            transport,
            policy: self.policy,
            metrics,
            limiter: self.limiter,
            queue,
            chains: Mutex::new(Vec::new()),
            bootstrap: Mutex::new(BootstrapState {
                hook: self.bootstrap,
                attempted: false,
                error: None,
            }),
            config: self.config,
            clock: self.clock,
            sleeper: self.sleeper,
            worker: Mutex::new(worker),
        })
    }
}

/// Blocking rotation façade with the same contract as the async shape.
pub struct Rotator {
    pool: Arc<ProxyPool>,
    strategy: ArcSwap<Box<dyn RotationStrategy>>,
    breakers: Arc<BreakerRegistry<CircuitBreaker>>,
    transport: Arc<dyn BlockingTransport>,
    policy: RetryPolicy,
    metrics: Arc<MetricsCollector>,
    limiter: Option<Arc<dyn RateLimiter>>,
    queue: Option<RequestQueue<QueuedRequest>>,
    chains: Mutex<Vec<ProxyChain>>,
    bootstrap: Mutex<BootstrapState>,
    config: RotatorConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn BlockingSleeper>,
    worker: Mutex<AggregationWorker>,
}

impl std::fmt::Debug for Rotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("blocking::Rotator")
            .field("pool_size", &self.pool.size())
            .field("strategy", &self.strategy.load().name())
            .finish()
    }
}

impl Rotator {
    pub fn builder() -> RotatorBuilder {
        RotatorBuilder::new()
    }

    pub fn add_proxy(&self, proxy: Proxy) -> bool {
        let id = proxy.id;
        let masked = proxy.masked_url();
        if !self.pool.add(proxy) {
            return false;
        }
        let breaker =
            CircuitBreaker::with_config(id, self.config.breaker).with_clock(Arc::clone(&self.clock));
        self.breakers.register(id, Arc::new(breaker));
        tracing::info!(proxy_id = %id, proxy = %masked, "added proxy to pool");
        true
    }

    pub fn add_proxy_url(&self, url: &str) -> Result<Uuid, RotatorError> {
        let proxy = Proxy::parse(url)?;
        let id = proxy.id;
        self.add_proxy(proxy);
        Ok(id)
    }

    pub fn remove_proxy(&self, id: Uuid) -> Option<Proxy> {
        self.transport.evict(id);
        self.breakers.remove(id);
        let removed = self.pool.remove(id)?;
        tracing::info!(proxy_id = %id, "removed proxy from pool");
        Some(removed)
    }

    pub fn add_chain(&self, chain: ProxyChain) {
        let entry = chain.tagged_entry();
        tracing::info!(
            chain = chain.name.as_deref().unwrap_or("unnamed"),
            hops = chain.len(),
            entry = %entry.masked_url(),
            "registered proxy chain"
        );
        self.add_proxy(entry);
        self.chains.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(chain);
    }

    pub fn chains(&self) -> Vec<ProxyChain> {
        self.chains.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn remove_chain(&self, name: &str) -> bool {
        let chain = {
            let mut chains = self.chains.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match chains.iter().position(|c| c.name.as_deref() == Some(name)) {
                Some(index) => chains.remove(index),
                None => {
                    tracing::warn!(chain = name, "chain not found");
                    return false;
                }
            }
        };
        self.remove_proxy(chain.entry_proxy().id);
        tracing::info!(chain = name, "removed proxy chain");
        true
    }

    pub fn clear_unhealthy(&self) -> usize {
        let removed = self.pool.clear_unhealthy();
        for id in &removed {
            self.breakers.remove(*id);
            self.transport.evict(*id);
        }
        removed.len()
    }

    pub fn proxies(&self) -> Vec<Proxy> {
        self.pool.snapshot()
    }

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

    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<TransportResponse, RotatorError> {
        self.ensure_bootstrap()?;

        let proxy = self.select_proxy(
            None,
            options.session_key.as_deref(),
            options.target_region.as_deref(),
        )?;

        if let Some(limiter) = &self.limiter {
            if !limiter.check(proxy.id) {
                tracing::warn!(
                    proxy_id = %proxy.id,
                    proxy = %proxy.masked_url(),
                    "rate limit exceeded for proxy"
                );
                if let Some(queue) = &self.queue {
                    queue.push(QueuedRequest { method, url: url.to_string(), options, proxy })?;
                    return self.process_queued();
                }
                return Err(RotatorError::connection(
                    format!("rate limit exceeded for proxy {}", proxy.id),
                    None,
                ));
            }
        }

        self.dispatch(method, url, options, proxy)
    }

    pub fn get(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::GET, url, options)
    }

    pub fn post(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::POST, url, options)
    }

    pub fn put(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::PUT, url, options)
    }

    pub fn delete(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::DELETE, url, options)
    }

    pub fn patch(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::PATCH, url, options)
    }

    pub fn head(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::HEAD, url, options)
    }

    pub fn options(&self, url: &str, options: RequestOptions) -> Result<TransportResponse, RotatorError> {
        self.request(Method::OPTIONS, url, options)
    }

    pub fn get_proxy(&self) -> Result<Proxy, RotatorError> {
        self.select_proxy(None, None, None)
    }

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

    pub fn circuit_breaker_states(&self) -> BTreeMap<Uuid, BreakerState> {
        self.breakers
            .entries()
            .into_iter()
            .map(|(id, breaker)| (id, breaker.state()))
            .collect()
    }

    pub fn reset_circuit_breaker(&self, id: Uuid) -> Result<(), RotatorError> {
        let breaker = self.breakers.get(id).ok_or_else(|| {
            RotatorError::invalid_config(format!("no circuit breaker for proxy {id}"))
        })?;
        self.publish_transition(breaker.reset());
        tracing::info!(proxy_id = %id, "circuit breaker manually reset");
        Ok(())
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.as_ref().map(|q| q.stats()).unwrap_or_else(QueueStats::disabled)
    }

    pub fn clear_queue(&self) -> Result<usize, RotatorError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| RotatorError::invalid_config("request queue is not enabled"))?;
        let cleared = queue.clear();
        tracing::info!(cleared, "cleared request queue");
        Ok(cleared)
    }

    /// Stop the aggregation worker and release all pooled clients.
    pub fn close(&self) {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).stop();
        self.transport.close();
        tracing::debug!("rotator closed");
    }

    fn select_proxy(
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
                    let admission = breaker.should_attempt();
                    self.publish_transition(admission.transition);
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
        strategy.select(&admitted, &ctx).cloned().ok_or_else(RotatorError::all_proxies_failing)
    }

    fn dispatch(
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

        let executor = BlockingRetryExecutor::new(
            effective_policy.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.breakers),
            Arc::clone(&self.metrics),
        )
        .with_sleeper(Arc::clone(&self.sleeper))
        .with_clock(Arc::clone(&self.clock));

        let selector = Selector {
            rotator: self,
            session_key: options.session_key.clone(),
            target_region: options.target_region.clone(),
        };

        let started = Instant::now();
        let initial = proxy.clone();
        let transport = Arc::clone(&self.transport);
        let result = executor.execute(
            request_id,
            &method,
            proxy,
            |proxy| transport.execute(proxy, &transport_request),
            &selector,
        );

        match result {
            Ok(success) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                let status = success.response.status.as_u16();
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

    fn process_queued(&self) -> Result<TransportResponse, RotatorError> {
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
        self.dispatch(queued.method, &queued.url, queued.options, queued.proxy)
    }

    fn ensure_bootstrap(&self) -> Result<(), RotatorError> {
        if !self.pool.is_empty() {
            return Ok(());
        }

        let mut state = self.bootstrap.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
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
        let proxies = hook();
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
            self.add_proxy(proxy);
        }
        tracing::info!(count, "bootstrap populated the pool");
        Ok(())
    }

    fn publish_transition(&self, transition: Option<BreakerTransition>) {
        if let Some(transition) = transition {
            tracing::info!(
                proxy_id = %transition.proxy_id,
                from = %transition.from,
                to = %transition.to,
                "circuit breaker transitioned"
            );
            self.metrics.record_breaker_event(transition);
        }
    }
}

impl Drop for Rotator {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            worker.stop();
        }
    }
}

struct Selector<'a> {
    rotator: &'a Rotator,
    session_key: Option<String>,
    target_region: Option<String>,
}

impl BlockingAlternateSelector for Selector<'_> {
    fn select_alternate(&self, exclude: Uuid) -> Option<Proxy> {
        self.rotator
            .select_proxy(Some(exclude), self.session_key.as_deref(), self.target_region.as_deref())
            .ok()
    }
}
