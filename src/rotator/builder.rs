//! Construction of the async [`Rotator`](super::Rotator).

use crate::breaker::{AsyncCircuitBreaker, BreakerConfig, BreakerRegistry};
use crate::clock::{Clock, SystemClock};
use crate::error::RotatorError;
use crate::limiter::{RateLimiter, RequestQueue};
use crate::metrics::{MetricsCollector, MetricsConfig};
use crate::pool::{PoolConfig, ProxyPool};
use crate::proxy::Proxy;
use crate::retry::RetryPolicy;
use crate::rotator::{AggregationWorker, BootstrapHook, BootstrapState, Rotator};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::storage::Storage;
use crate::strategy::{RotationStrategy, RoundRobinStrategy, StrategyKind};
use crate::transport::{ClientSettings, ReqwestTransport, Transport};
use arc_swap::ArcSwap;
use futures::future::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Rotator-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Per-proxy HTTP client construction settings.
    pub client: ClientSettings,
    /// Maximum cached per-proxy clients before LRU eviction.
    pub client_pool_capacity: usize,
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    pub metrics: MetricsConfig,
    /// Queue rate-limited requests instead of failing them.
    pub queue_enabled: bool,
    pub queue_capacity: usize,
    /// Cadence of the background metrics rollup.
    pub aggregation_interval: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            client: ClientSettings::default(),
            client_pool_capacity: 100,
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
            metrics: MetricsConfig::default(),
            queue_enabled: false,
            queue_capacity: 100,
            aggregation_interval: Duration::from_secs(300),
        }
    }
}

/// Builder for the async rotator.
///
/// `build` must run inside a tokio runtime: it spawns the aggregation
/// worker.
pub struct RotatorBuilder {
    proxies: Vec<Proxy>,
    strategy: Option<Box<dyn RotationStrategy>>,
    policy: RetryPolicy,
    config: RotatorConfig,
    limiter: Option<Arc<dyn RateLimiter>>,
    storage: Option<Arc<dyn Storage>>,
    transport: Option<Arc<dyn Transport>>,
    bootstrap: Option<BootstrapHook>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RotatorBuilder {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            strategy: None,
            policy: RetryPolicy::default(),
            config: RotatorConfig::default(),
            limiter: None,
            storage: None,
            transport: None,
            bootstrap: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
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

    /// Parse and add a proxy URL.
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

    /// Strategy by name (`round-robin`, `random`, `weighted`, `least-used`,
    /// `performance`, `session`, `geo`).
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

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the transport (tests, exotic clients).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// One-shot hook invoked when the pool is empty on first request.
    pub fn bootstrap<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Proxy>> + Send + 'static,
    {
        self.bootstrap = Some(Box::new(move || hook().boxed()));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
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
        if self.config.breaker.failure_threshold == 0 {
            return Err(RotatorError::invalid_config("failure_threshold must be at least 1"));
        }

        let pool = Arc::new(ProxyPool::new(self.config.pool).with_clock(Arc::clone(&self.clock)));
        let breakers = Arc::new(BreakerRegistry::new());
        for proxy in self.proxies {
            let id = proxy.id;
            if pool.add(proxy) {
                let breaker = AsyncCircuitBreaker::with_config(id, self.config.breaker)
                    .with_clock(Arc::clone(&self.clock));
                breakers.register(id, Arc::new(breaker));
            }
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_capacity(
                self.config.client.clone(),
                self.config.client_pool_capacity,
            )),
        };

        let metrics =
            Arc::new(MetricsCollector::new(self.config.metrics).with_clock(Arc::clone(&self.clock)));
        let strategy: Box<dyn RotationStrategy> =
            self.strategy.unwrap_or_else(|| Box::new(RoundRobinStrategy::new()));

        let queue = self.config.queue_enabled.then(|| {
            tracing::info!(capacity = self.config.queue_capacity, "request queueing enabled");
            RequestQueue::new(self.config.queue_capacity)
        });

        let worker = spawn_aggregation_worker(Arc::clone(&metrics), self.config.aggregation_interval);

        Ok(Rotator {
            pool,
            strategy: ArcSwap::from_pointee(strategy),
            breakers,
            transport,
            policy: self.policy,
            metrics,
            limiter: self.limiter,
            queue,
            storage: self.storage,
            chains: Mutex::new(Vec::new()),
            bootstrap: tokio::sync::Mutex::new(BootstrapState {
                hook: self.bootstrap,
                attempted: false,
                error: None,
            }),
            config: self.config,
            clock: self.clock,
            sleeper: self.sleeper,
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn spawn_aggregation_worker(
    metrics: Arc<MetricsCollector>,
    interval: Duration,
) -> AggregationWorker {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the cadence starts
        // one full interval after construction.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    metrics.aggregate_hourly();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("aggregation worker stopped");
    });
    AggregationWorker { handle, shutdown: shutdown_tx }
}
