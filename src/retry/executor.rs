//! Async retry executor: drives one logical request across attempts,
//! breakers, backoff, and alternate proxies.

use crate::breaker::{AsyncCircuitBreaker, BreakerRegistry, BreakerTransition};
use crate::clock::{Clock, SystemClock};
use crate::error::RotatorError;
use crate::metrics::{AttemptOutcome, AttemptRecord, MetricsCollector};
use crate::pool::ProxyPool;
use crate::proxy::Proxy;
use crate::retry::policy::{is_idempotent, RetryPolicy};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::storage::Storage;
use crate::transport::{TransportError, TransportErrorKind, TransportResponse};
use async_trait::async_trait;
use reqwest::Method;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Supplies a replacement proxy after a failure, excluding the one that
/// just failed. Returning `None` keeps the retry on the current proxy.
#[async_trait]
pub trait AlternateSelector: Send + Sync {
    async fn select_alternate(&self, exclude: Uuid) -> Option<Proxy>;
}

/// Selector that never switches proxies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAlternate;

#[async_trait]
impl AlternateSelector for NoAlternate {
    async fn select_alternate(&self, _exclude: Uuid) -> Option<Proxy> {
        None
    }
}

/// A completed request: the response plus which proxy finally served it.
#[derive(Debug)]
pub struct ExecutionSuccess {
    pub response: TransportResponse,
    pub proxy: Proxy,
    pub attempts: u32,
}

/// Orchestrates one logical request.
///
/// Per attempt: consult the proxy's breaker, invoke the transport, record
/// exactly one [`AttemptRecord`], propagate the outcome to the proxy's
/// counters and breaker, and on failure ask the selector for an alternate
/// proxy. The whole-call budget (when configured) bounds backoff sleeps and
/// cancels in-flight attempts.
pub struct RetryExecutor {
    policy: RetryPolicy,
    pool: Arc<ProxyPool>,
    breakers: Arc<BreakerRegistry<AsyncCircuitBreaker>>,
    metrics: Arc<MetricsCollector>,
    storage: Option<Arc<dyn Storage>>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor").field("policy", &self.policy).finish()
    }
}

impl RetryExecutor {
    pub fn new(
        policy: RetryPolicy,
        pool: Arc<ProxyPool>,
        breakers: Arc<BreakerRegistry<AsyncCircuitBreaker>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            policy,
            pool,
            breakers,
            metrics,
            storage: None,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<F, Fut, S>(
        &self,
        request_id: Uuid,
        method: &Method,
        initial: Proxy,
        attempt_fn: F,
        selector: &S,
    ) -> Result<ExecutionSuccess, RotatorError>
    where
        F: Fn(Proxy) -> Fut + Send + Sync,
        Fut: Future<Output = Result<TransportResponse, TransportError>> + Send,
        S: AlternateSelector + ?Sized,
    {
        if !is_idempotent(method) && !self.policy.retry_non_idempotent() {
            tracing::debug!(%method, "non-idempotent method, executing exactly once");
            return self.execute_once(request_id, initial, attempt_fn).await;
        }

        let start = Instant::now();
        let mut current = initial;
        let mut attempt_index: u32 = 0;
        let mut previous_delay: Option<Duration> = None;
        let mut last_error: Option<TransportError> = None;
        // Selection already performed the admission check (and may hold the
        // half-open probe claim), so the executor only re-checks admission
        // when it keeps retrying on the same proxy.
        let mut freshly_selected = true;

        while attempt_index < self.policy.max_attempts() {
            if self.budget_spent(start) {
                self.record_timeout(request_id, attempt_index, current.id);
                return Err(self.timeout_error(start, last_error));
            }

            let mut delay = Duration::ZERO;
            if attempt_index > 0 {
                delay = self.policy.calculate_delay(attempt_index - 1, previous_delay);
                if let Some(budget) = self.policy.timeout() {
                    delay = delay.min(budget.saturating_sub(start.elapsed()));
                }
                tracing::debug!(
                    attempt = attempt_index + 1,
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                self.sleeper.sleep(delay).await;
                previous_delay = Some(delay);
                if self.budget_spent(start) {
                    self.record_timeout(request_id, attempt_index, current.id);
                    return Err(self.timeout_error(start, last_error));
                }
            }

            if !freshly_selected && !self.admitted(&current).await {
                self.record(
                    request_id,
                    attempt_index,
                    current.id,
                    AttemptOutcome::CircuitOpen,
                    delay,
                    Duration::ZERO,
                    None,
                    Some("circuit breaker open".to_string()),
                );
                attempt_index += 1;
                if let Some(alternate) = selector.select_alternate(current.id).await {
                    current = alternate;
                    freshly_selected = true;
                }
                continue;
            }

            let attempt_start = Instant::now();
            let outcome = match self.policy.timeout() {
                Some(budget) => {
                    let remaining = budget.saturating_sub(start.elapsed());
                    match tokio::time::timeout(remaining, attempt_fn(current.clone())).await {
                        Ok(result) => result,
                        Err(_) => {
                            self.record(
                                request_id,
                                attempt_index,
                                current.id,
                                AttemptOutcome::Timeout,
                                delay,
                                attempt_start.elapsed(),
                                None,
                                Some("whole-call timeout exceeded".to_string()),
                            );
                            // The cancelled attempt counts as a failure so a
                            // half-open probe claim is released.
                            self.record_proxy_failure(&current).await;
                            return Err(self.timeout_error(start, last_error));
                        }
                    }
                }
                None => attempt_fn(current.clone()).await,
            };
            let latency = attempt_start.elapsed();
            freshly_selected = false;

            match outcome {
                Ok(response) => {
                    let status = response.status.as_u16();
                    if status == 401 || status == 407 {
                        self.record(
                            request_id,
                            attempt_index,
                            current.id,
                            AttemptOutcome::Failure,
                            delay,
                            latency,
                            Some(status),
                            Some("proxy authentication failed".to_string()),
                        );
                        self.record_proxy_failure(&current).await;
                        return Err(RotatorError::Authentication {
                            status,
                            message: format!("proxy {} rejected credentials", current.masked_url()),
                        });
                    }
                    if self.policy.is_retryable_status(status) {
                        tracing::warn!(
                            proxy_id = %current.id,
                            status,
                            "retryable status from upstream"
                        );
                        self.record(
                            request_id,
                            attempt_index,
                            current.id,
                            AttemptOutcome::Failure,
                            delay,
                            latency,
                            Some(status),
                            Some(format!("status {status}")),
                        );
                        self.record_proxy_failure(&current).await;
                        last_error = Some(TransportError::new(
                            TransportErrorKind::Network,
                            format!("received retryable status {status}"),
                        ));
                        attempt_index += 1;
                        if let Some(alternate) = selector.select_alternate(current.id).await {
                            current = alternate;
                            freshly_selected = true;
                        }
                        continue;
                    }

                    self.record(
                        request_id,
                        attempt_index,
                        current.id,
                        AttemptOutcome::Success,
                        delay,
                        latency,
                        Some(status),
                        None,
                    );
                    self.record_proxy_success(&current, latency).await;
                    tracing::info!(
                        proxy_id = %current.id,
                        attempt = attempt_index + 1,
                        status,
                        "request succeeded"
                    );
                    return Ok(ExecutionSuccess {
                        response,
                        proxy: current,
                        attempts: attempt_index + 1,
                    });
                }
                Err(error) => {
                    self.record(
                        request_id,
                        attempt_index,
                        current.id,
                        AttemptOutcome::Failure,
                        delay,
                        latency,
                        None,
                        Some(error.to_string()),
                    );
                    if !error.is_retryable() {
                        tracing::error!(proxy_id = %current.id, error = %error, "non-retryable error");
                        return Err(RotatorError::NonRetryable { source: Box::new(error) });
                    }
                    tracing::warn!(proxy_id = %current.id, error = %error, "transient error");
                    self.record_proxy_failure(&current).await;
                    last_error = Some(error);
                    attempt_index += 1;
                    if let Some(alternate) = selector.select_alternate(current.id).await {
                        current = alternate;
                        freshly_selected = true;
                    }
                    continue;
                }
            }
        }

        tracing::error!(
            %request_id,
            attempts = self.policy.max_attempts(),
            "all retry attempts exhausted"
        );
        Err(RotatorError::connection(
            format!("request failed after {} attempts", self.policy.max_attempts()),
            last_error.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        ))
    }

    /// Single-shot path for non-idempotent methods: the transport runs
    /// exactly once and a retryable status comes back to the caller raw.
    async fn execute_once<F, Fut>(
        &self,
        request_id: Uuid,
        proxy: Proxy,
        attempt_fn: F,
    ) -> Result<ExecutionSuccess, RotatorError>
    where
        F: Fn(Proxy) -> Fut + Send + Sync,
        Fut: Future<Output = Result<TransportResponse, TransportError>> + Send,
    {
        let attempt_start = Instant::now();
        match attempt_fn(proxy.clone()).await {
            Ok(response) => {
                let status = response.status.as_u16();
                let latency = attempt_start.elapsed();
                if status == 401 || status == 407 {
                    self.record(
                        request_id,
                        0,
                        proxy.id,
                        AttemptOutcome::Failure,
                        Duration::ZERO,
                        latency,
                        Some(status),
                        Some("proxy authentication failed".to_string()),
                    );
                    self.record_proxy_failure(&proxy).await;
                    return Err(RotatorError::Authentication {
                        status,
                        message: format!("proxy {} rejected credentials", proxy.masked_url()),
                    });
                }
                if self.policy.is_retryable_status(status) {
                    self.record(
                        request_id,
                        0,
                        proxy.id,
                        AttemptOutcome::Failure,
                        Duration::ZERO,
                        latency,
                        Some(status),
                        Some(format!("status {status}")),
                    );
                    self.record_proxy_failure(&proxy).await;
                } else {
                    self.record(
                        request_id,
                        0,
                        proxy.id,
                        AttemptOutcome::Success,
                        Duration::ZERO,
                        latency,
                        Some(status),
                        None,
                    );
                    self.record_proxy_success(&proxy, latency).await;
                }
                Ok(ExecutionSuccess { response, proxy, attempts: 1 })
            }
            Err(error) => {
                let latency = attempt_start.elapsed();
                self.record(
                    request_id,
                    0,
                    proxy.id,
                    AttemptOutcome::Failure,
                    Duration::ZERO,
                    latency,
                    None,
                    Some(error.to_string()),
                );
                self.record_proxy_failure(&proxy).await;
                if error.is_retryable() {
                    Err(RotatorError::connection(
                        format!("request failed: {error}"),
                        Some(Box::new(error)),
                    ))
                } else {
                    Err(RotatorError::NonRetryable { source: Box::new(error) })
                }
            }
        }
    }

    async fn admitted(&self, proxy: &Proxy) -> bool {
        match self.breakers.get(proxy.id) {
            Some(breaker) => {
                let admission = breaker.should_attempt().await;
                self.publish_transition(&breaker, admission.transition).await;
                admission.allowed
            }
            None => true,
        }
    }

    async fn record_proxy_failure(&self, proxy: &Proxy) {
        self.pool.record_failure(proxy.id);
        if let Some(breaker) = self.breakers.get(proxy.id) {
            let transition = breaker.record_failure().await;
            self.publish_transition(&breaker, transition).await;
        }
    }

    async fn record_proxy_success(&self, proxy: &Proxy, latency: Duration) {
        self.pool.record_success(proxy.id, latency.as_secs_f64() * 1_000.0);
        if let Some(breaker) = self.breakers.get(proxy.id) {
            let transition = breaker.record_success().await;
            self.publish_transition(&breaker, transition).await;
        }
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

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        request_id: Uuid,
        attempt_number: u32,
        proxy_id: Uuid,
        outcome: AttemptOutcome,
        delay_before: Duration,
        latency: Duration,
        status_code: Option<u16>,
        error: Option<String>,
    ) {
        self.metrics.record_attempt(AttemptRecord {
            request_id,
            attempt_number,
            proxy_id,
            timestamp: self.clock.now_utc(),
            outcome,
            status_code,
            delay_before,
            latency,
            error,
        });
    }

    fn record_timeout(&self, request_id: Uuid, attempt_index: u32, proxy_id: Uuid) {
        self.record(
            request_id,
            attempt_index,
            proxy_id,
            AttemptOutcome::Timeout,
            Duration::ZERO,
            Duration::ZERO,
            None,
            Some("whole-call timeout exceeded".to_string()),
        );
    }

    fn budget_spent(&self, start: Instant) -> bool {
        self.policy.timeout().is_some_and(|budget| start.elapsed() >= budget)
    }

    fn timeout_error(&self, start: Instant, last_error: Option<TransportError>) -> RotatorError {
        RotatorError::connection(
            format!("request timed out after {:.2?}", start.elapsed()),
            last_error.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::metrics::MetricsConfig;
    use crate::pool::PoolConfig;
    use crate::proxy::ProxyScheme;
    use crate::sleeper::TrackingSleeper;
    use crate::transport::TransportErrorKind;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn response(status: u16) -> TransportResponse {
        TransportResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: Default::default(),
            body: Vec::new(),
            url: "https://example.com/".to_string(),
        }
    }

    struct Fixture {
        pool: Arc<ProxyPool>,
        breakers: Arc<BreakerRegistry<AsyncCircuitBreaker>>,
        metrics: Arc<MetricsCollector>,
        sleeper: TrackingSleeper,
    }

    impl Fixture {
        fn new(proxies: &[Proxy]) -> Self {
            let pool = Arc::new(ProxyPool::new(PoolConfig::default()));
            let breakers = Arc::new(BreakerRegistry::new());
            for proxy in proxies {
                pool.add(proxy.clone());
                breakers.register(proxy.id, Arc::new(AsyncCircuitBreaker::new(proxy.id)));
            }
            Self {
                pool,
                breakers,
                metrics: Arc::new(MetricsCollector::new(MetricsConfig::default())),
                sleeper: TrackingSleeper::new(),
            }
        }

        fn executor(&self, policy: RetryPolicy) -> RetryExecutor {
            RetryExecutor::new(
                policy,
                Arc::clone(&self.pool),
                Arc::clone(&self.breakers),
                Arc::clone(&self.metrics),
            )
            .with_sleeper(Arc::new(self.sleeper.clone()))
        }
    }

    /// Hands out a fixed list of alternates in order.
    #[derive(Debug)]
    struct QueuedAlternates {
        proxies: Mutex<VecDeque<Proxy>>,
    }

    impl QueuedAlternates {
        fn new(proxies: impl IntoIterator<Item = Proxy>) -> Self {
            Self { proxies: Mutex::new(proxies.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl AlternateSelector for QueuedAlternates {
        async fn select_alternate(&self, exclude: Uuid) -> Option<Proxy> {
            let mut proxies = self.proxies.lock().unwrap();
            let next = proxies.pop_front()?;
            assert_ne!(next.id, exclude, "alternate must differ from the failed proxy");
            Some(next)
        }
    }

    fn proxy(host: &str) -> Proxy {
        Proxy::new(ProxyScheme::Http, host, 8080)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .unwrap()
            .base_delay(Duration::from_millis(10))
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn success_on_first_attempt_records_one_success() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        let executor = fixture.executor(policy(3));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let result = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                move |_proxy| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(response(200))
                    }
                },
                &NoAlternate,
            )
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.proxy.id, p1.id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.metrics.attempt_count(), 1);
        assert_eq!(fixture.pool.get(p1.id).unwrap().total_successes, 1);
    }

    #[tokio::test]
    async fn retries_across_alternate_proxies() {
        let p1 = proxy("p1");
        let p2 = proxy("p2");
        let fixture = Fixture::new(&[p1.clone(), p2.clone()]);
        let executor = fixture.executor(policy(3));
        let selector = QueuedAlternates::new([p2.clone(), p1.clone()]);

        let p1_id = p1.id;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                move |proxy| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        match calls.fetch_add(1, Ordering::SeqCst) {
                            0 => Err(TransportError::new(
                                TransportErrorKind::Connect,
                                "connection refused",
                            )),
                            1 => Ok(response(503)),
                            _ => {
                                assert_eq!(proxy.id, p1_id, "third attempt lands back on p1");
                                Ok(response(200))
                            }
                        }
                    }
                },
                &selector,
            )
            .await
            .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(result.proxy.id, p1.id);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.metrics.attempt_count(), 3);
        assert!(fixture.pool.get(p1.id).unwrap().total_failures >= 1);
        assert!(fixture.pool.get(p2.id).unwrap().total_failures >= 1);
        // Backoff slept twice (before attempts 2 and 3).
        assert_eq!(fixture.sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_cause() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        let executor = fixture.executor(policy(3));

        let err = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                |_proxy| async {
                    Err::<TransportResponse, _>(TransportError::new(
                        TransportErrorKind::Reset,
                        "connection reset by peer",
                    ))
                },
                &NoAlternate,
            )
            .await
            .unwrap_err();

        assert!(err.is_connection());
        assert!(err.to_string().contains("failed after 3 attempts"));
        let source = std::error::Error::source(&err).expect("carries the last cause");
        assert!(source.to_string().contains("reset"));
        assert_eq!(fixture.metrics.attempt_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        let executor = fixture.executor(policy(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let err = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                move |_proxy| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<TransportResponse, _>(TransportError::new(
                            TransportErrorKind::Decode,
                            "invalid body",
                        ))
                    }
                },
                &NoAlternate,
            )
            .await
            .unwrap_err();

        assert!(err.is_non_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.metrics.attempt_count(), 1);
        // Non-retryable failures do not drive the breaker.
        assert_eq!(fixture.pool.get(p1.id).unwrap().total_failures, 0);
    }

    #[tokio::test]
    async fn authentication_status_surfaces_without_retry() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        let executor = fixture.executor(policy(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let err = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                move |_proxy| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(response(407))
                    }
                },
                &NoAlternate,
            )
            .await
            .unwrap_err();

        assert!(err.is_authentication());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.metrics.attempt_count(), 1);
        // The breaker is told so repeated auth failures isolate the proxy.
        assert_eq!(fixture.pool.get(p1.id).unwrap().total_failures, 1);
    }

    #[tokio::test]
    async fn non_idempotent_method_executes_exactly_once() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        let executor = fixture.executor(policy(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let result = executor
            .execute(
                Uuid::new_v4(),
                &Method::POST,
                p1.clone(),
                move |_proxy| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(response(503))
                    }
                },
                &NoAlternate,
            )
            .await
            .unwrap();

        // The caller gets the raw 503 back, no retry-exhausted error.
        assert_eq!(result.response.status.as_u16(), 503);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.metrics.attempt_count(), 1);
        assert_eq!(fixture.pool.get(p1.id).unwrap().total_failures, 1);
    }

    #[tokio::test]
    async fn retry_non_idempotent_override_enables_retries() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .base_delay(Duration::from_millis(10))
            .unwrap()
            .retry_non_idempotent(true)
            .build();
        let executor = fixture.executor(policy);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let result = executor
            .execute(
                Uuid::new_v4(),
                &Method::POST,
                p1.clone(),
                move |_proxy| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Ok(response(503))
                        } else {
                            Ok(response(201))
                        }
                    }
                },
                &NoAlternate,
            )
            .await
            .unwrap();

        assert_eq!(result.response.status.as_u16(), 201);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_that_opens_breaker_switches_to_alternate() {
        let p1 = proxy("p1");
        let p2 = proxy("p2");
        let fixture = Fixture::new(&[p1.clone(), p2.clone()]);
        let executor = fixture.executor(policy(3));

        // Four prior failures: the next one trips the default threshold.
        let breaker = fixture.breakers.get(p1.id).unwrap();
        for _ in 0..4 {
            breaker.record_failure().await;
        }

        let p1_id = p1.id;
        let selector = QueuedAlternates::new([p2.clone()]);
        let result = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                move |proxy| async move {
                    if proxy.id == p1_id {
                        Err(TransportError::new(TransportErrorKind::Connect, "refused"))
                    } else {
                        Ok(response(200))
                    }
                },
                &selector,
            )
            .await
            .unwrap();

        assert_eq!(result.proxy.id, p2.id);
        assert_eq!(result.attempts, 2);
        let events = fixture.metrics.breaker_events();
        assert!(events.iter().any(|e| e.proxy_id == p1_id), "breaker open event recorded");
    }

    #[tokio::test]
    async fn same_proxy_retry_against_open_breaker_records_circuit_open() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        // Threshold 1: the first failure opens the breaker immediately.
        fixture.breakers.register(
            p1.id,
            Arc::new(AsyncCircuitBreaker::with_config(
                p1.id,
                BreakerConfig { failure_threshold: 1, ..Default::default() },
            )),
        );
        let executor = fixture.executor(policy(3));

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let err = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                move |_proxy| {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<TransportResponse, _>(TransportError::new(
                            TransportErrorKind::Connect,
                            "refused",
                        ))
                    }
                },
                &NoAlternate,
            )
            .await
            .unwrap_err();

        assert!(err.is_connection());
        // Only the first attempt reached the transport; the rest were
        // refused by the now-open breaker and recorded as circuit_open.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.metrics.attempt_count(), 3);
    }

    #[tokio::test]
    async fn whole_call_timeout_cancels_inflight_attempt() {
        let p1 = proxy("p1");
        let fixture = Fixture::new(&[p1.clone()]);
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .timeout(Duration::from_millis(50))
            .unwrap()
            .build();
        let executor = fixture.executor(policy);

        let started = Instant::now();
        let err = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                |_proxy| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(response(200))
                },
                &NoAlternate,
            )
            .await
            .unwrap_err();

        assert!(err.is_connection());
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(1), "budget must cancel the attempt");
        assert_eq!(fixture.metrics.attempt_count(), 1);
    }
}
