//! Blocking retry executor, mirroring the async shape.
//!
//! Differences from the async executor: sleeps block the calling thread,
//! and the whole-call budget is enforced between attempts only; an
//! in-flight attempt is bounded by the transport's own per-attempt timeout
//! rather than cancelled mid-stream.

use crate::breaker::{BreakerRegistry, BreakerTransition, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::error::RotatorError;
use crate::metrics::{AttemptOutcome, AttemptRecord, MetricsCollector};
use crate::pool::ProxyPool;
use crate::proxy::Proxy;
use crate::retry::policy::{is_idempotent, RetryPolicy};
use crate::sleeper::{BlockingSleeper, ThreadSleeper};
use crate::transport::{TransportError, TransportErrorKind, TransportResponse};
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Blocking counterpart of the async alternate selector.
pub trait BlockingAlternateSelector: Send + Sync {
    fn select_alternate(&self, exclude: Uuid) -> Option<Proxy>;
}

/// Selector that never switches proxies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlockingAlternate;

impl BlockingAlternateSelector for NoBlockingAlternate {
    fn select_alternate(&self, _exclude: Uuid) -> Option<Proxy> {
        None
    }
}

/// A completed blocking request.
#[derive(Debug)]
pub struct BlockingExecutionSuccess {
    pub response: TransportResponse,
    pub proxy: Proxy,
    pub attempts: u32,
}

/// Blocking retry orchestrator over the sync circuit breakers.
pub struct BlockingRetryExecutor {
    policy: RetryPolicy,
    pool: Arc<ProxyPool>,
    breakers: Arc<BreakerRegistry<CircuitBreaker>>,
    metrics: Arc<MetricsCollector>,
    sleeper: Arc<dyn BlockingSleeper>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BlockingRetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingRetryExecutor").field("policy", &self.policy).finish()
    }
}

impl BlockingRetryExecutor {
    pub fn new(
        policy: RetryPolicy,
        pool: Arc<ProxyPool>,
        breakers: Arc<BreakerRegistry<CircuitBreaker>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            policy,
            pool,
            breakers,
            metrics,
            sleeper: Arc::new(ThreadSleeper),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn BlockingSleeper>) -> Self {
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

    pub fn execute<F, S>(
        &self,
        request_id: Uuid,
        method: &Method,
        initial: Proxy,
        mut attempt_fn: F,
        selector: &S,
    ) -> Result<BlockingExecutionSuccess, RotatorError>
    where
        F: FnMut(&Proxy) -> Result<TransportResponse, TransportError>,
        S: BlockingAlternateSelector + ?Sized,
    {
        if !is_idempotent(method) && !self.policy.retry_non_idempotent() {
            tracing::debug!(%method, "non-idempotent method, executing exactly once");
            return self.execute_once(request_id, initial, &mut attempt_fn);
        }

        let start = Instant::now();
        let mut current = initial;
        let mut attempt_index: u32 = 0;
        let mut previous_delay: Option<Duration> = None;
        let mut last_error: Option<TransportError> = None;
        // Selection already performed the admission check (and may hold the
        // half-open probe claim); only re-check when retrying on the same
        // proxy.
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
                self.sleeper.sleep(delay);
                previous_delay = Some(delay);
                if self.budget_spent(start) {
                    self.record_timeout(request_id, attempt_index, current.id);
                    return Err(self.timeout_error(start, last_error));
                }
            }

            if !freshly_selected && !self.admitted(&current) {
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
                if let Some(alternate) = selector.select_alternate(current.id) {
                    current = alternate;
                    freshly_selected = true;
                }
                continue;
            }

            let attempt_start = Instant::now();
            let outcome = attempt_fn(&current);
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
                        self.record_proxy_failure(&current);
                        return Err(RotatorError::Authentication {
                            status,
                            message: format!("proxy {} rejected credentials", current.masked_url()),
                        });
                    }
                    if self.policy.is_retryable_status(status) {
                        tracing::warn!(proxy_id = %current.id, status, "retryable status from upstream");
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
                        self.record_proxy_failure(&current);
                        last_error = Some(TransportError::new(
                            TransportErrorKind::Network,
                            format!("received retryable status {status}"),
                        ));
                        attempt_index += 1;
                        if let Some(alternate) = selector.select_alternate(current.id) {
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
                    self.record_proxy_success(&current, latency);
                    return Ok(BlockingExecutionSuccess {
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
                        return Err(RotatorError::NonRetryable { source: Box::new(error) });
                    }
                    self.record_proxy_failure(&current);
                    last_error = Some(error);
                    attempt_index += 1;
                    if let Some(alternate) = selector.select_alternate(current.id) {
                        current = alternate;
                        freshly_selected = true;
                    }
                    continue;
                }
            }
        }

        Err(RotatorError::connection(
            format!("request failed after {} attempts", self.policy.max_attempts()),
            last_error.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        ))
    }

    fn execute_once<F>(
        &self,
        request_id: Uuid,
        proxy: Proxy,
        attempt_fn: &mut F,
    ) -> Result<BlockingExecutionSuccess, RotatorError>
    where
        F: FnMut(&Proxy) -> Result<TransportResponse, TransportError>,
    {
        let attempt_start = Instant::now();
        match attempt_fn(&proxy) {
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
                    self.record_proxy_failure(&proxy);
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
                    self.record_proxy_failure(&proxy);
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
                    self.record_proxy_success(&proxy, latency);
                }
                Ok(BlockingExecutionSuccess { response, proxy, attempts: 1 })
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
                self.record_proxy_failure(&proxy);
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

    fn admitted(&self, proxy: &Proxy) -> bool {
        match self.breakers.get(proxy.id) {
            Some(breaker) => {
                let admission = breaker.should_attempt();
                self.publish_transition(admission.transition);
                admission.allowed
            }
            None => true,
        }
    }

    fn record_proxy_failure(&self, proxy: &Proxy) {
        self.pool.record_failure(proxy.id);
        if let Some(breaker) = self.breakers.get(proxy.id) {
            self.publish_transition(breaker.record_failure());
        }
    }

    fn record_proxy_success(&self, proxy: &Proxy, latency: Duration) {
        self.pool.record_success(proxy.id, latency.as_secs_f64() * 1_000.0);
        if let Some(breaker) = self.breakers.get(proxy.id) {
            self.publish_transition(breaker.record_success());
        }
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
    use crate::metrics::MetricsConfig;
    use crate::pool::PoolConfig;
    use crate::proxy::ProxyScheme;
    use crate::sleeper::TrackingSleeper;
    use reqwest::StatusCode;

    fn response(status: u16) -> TransportResponse {
        TransportResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: Default::default(),
            body: Vec::new(),
            url: "https://example.com/".to_string(),
        }
    }

    fn fixture(proxies: &[Proxy]) -> (Arc<ProxyPool>, Arc<BreakerRegistry<CircuitBreaker>>, Arc<MetricsCollector>)
    {
        let pool = Arc::new(ProxyPool::new(PoolConfig::default()));
        let breakers = Arc::new(BreakerRegistry::new());
        for proxy in proxies {
            pool.add(proxy.clone());
            breakers.register(proxy.id, Arc::new(CircuitBreaker::new(proxy.id)));
        }
        (pool, breakers, Arc::new(MetricsCollector::new(MetricsConfig::default())))
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .unwrap()
            .base_delay(Duration::from_millis(5))
            .unwrap()
            .build()
    }

    #[test]
    fn retries_until_success() {
        let p1 = Proxy::new(ProxyScheme::Http, "p1", 8080);
        let (pool, breakers, metrics) = fixture(std::slice::from_ref(&p1));
        let sleeper = TrackingSleeper::new();
        let executor = BlockingRetryExecutor::new(
            policy(3),
            Arc::clone(&pool),
            breakers,
            Arc::clone(&metrics),
        )
        .with_sleeper(Arc::new(sleeper.clone()));

        let mut calls = 0;
        let result = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                |_proxy| {
                    calls += 1;
                    if calls < 3 {
                        Err(TransportError::new(TransportErrorKind::Connect, "refused"))
                    } else {
                        Ok(response(200))
                    }
                },
                &NoBlockingAlternate,
            )
            .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(calls, 3);
        assert_eq!(metrics.attempt_count(), 3);
        assert_eq!(sleeper.delays().len(), 2);
        let proxy = pool.get(p1.id).unwrap();
        assert_eq!(proxy.total_failures, 2);
        assert_eq!(proxy.total_successes, 1);
    }

    #[test]
    fn post_without_override_runs_once_and_returns_raw_response() {
        let p1 = Proxy::new(ProxyScheme::Http, "p1", 8080);
        let (pool, breakers, metrics) = fixture(std::slice::from_ref(&p1));
        let executor = BlockingRetryExecutor::new(
            policy(3),
            Arc::clone(&pool),
            breakers,
            Arc::clone(&metrics),
        );

        let mut calls = 0;
        let result = executor
            .execute(
                Uuid::new_v4(),
                &Method::POST,
                p1.clone(),
                |_proxy| {
                    calls += 1;
                    Ok(response(503))
                },
                &NoBlockingAlternate,
            )
            .unwrap();

        assert_eq!(result.response.status.as_u16(), 503);
        assert_eq!(calls, 1);
        assert_eq!(metrics.attempt_count(), 1);
        assert_eq!(pool.get(p1.id).unwrap().total_failures, 1);
    }

    #[test]
    fn breaker_opens_after_repeated_failures() {
        let p1 = Proxy::new(ProxyScheme::Http, "p1", 8080);
        let (pool, breakers, metrics) = fixture(std::slice::from_ref(&p1));
        let executor = BlockingRetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(10)
                .unwrap()
                .base_delay(Duration::from_millis(1))
                .unwrap()
                .build(),
            pool,
            Arc::clone(&breakers),
            Arc::clone(&metrics),
        )
        .with_sleeper(Arc::new(crate::sleeper::InstantSleeper));

        let err = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                |_proxy| {
                    Err::<TransportResponse, _>(TransportError::new(
                        TransportErrorKind::Connect,
                        "refused",
                    ))
                },
                &NoBlockingAlternate,
            )
            .unwrap_err();

        assert!(err.is_connection());
        // The default threshold is 5: the breaker opened mid-run and the
        // remaining attempts recorded circuit_open instead of failures.
        let breaker = breakers.get(p1.id).unwrap();
        assert_ne!(breaker.state(), crate::breaker::BreakerState::Closed);
        let events = metrics.breaker_events();
        assert!(!events.is_empty());
        assert_eq!(events[0].to, crate::breaker::BreakerState::Open);
    }

    #[test]
    fn whole_call_budget_checked_between_attempts() {
        let p1 = Proxy::new(ProxyScheme::Http, "p1", 8080);
        let (pool, breakers, metrics) = fixture(std::slice::from_ref(&p1));
        let executor = BlockingRetryExecutor::new(
            RetryPolicy::builder()
                .max_attempts(5)
                .unwrap()
                .base_delay(Duration::from_millis(30))
                .unwrap()
                .curve(crate::backoff::BackoffCurve::Fixed)
                .timeout(Duration::from_millis(40))
                .unwrap()
                .build(),
            pool,
            breakers,
            Arc::clone(&metrics),
        );

        let err = executor
            .execute(
                Uuid::new_v4(),
                &Method::GET,
                p1.clone(),
                |_proxy| {
                    std::thread::sleep(Duration::from_millis(25));
                    Err::<TransportResponse, _>(TransportError::new(
                        TransportErrorKind::TimedOut,
                        "read timeout",
                    ))
                },
                &NoBlockingAlternate,
            )
            .unwrap_err();

        assert!(err.is_connection());
        assert!(err.to_string().contains("timed out"));
        let records = metrics.attempt_count();
        assert!(records < 5, "budget must stop the loop early (got {records} attempts)");
    }
}
