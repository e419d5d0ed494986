//! Async circuit breaker for the tokio execution shape.
//!
//! Same state machine as the sync breaker; only the locking differs. The
//! critical sections never await, but an async mutex keeps admission fair
//! under contention from many concurrent request tasks.

use crate::breaker::core::{
    Admission, BreakerConfig, BreakerCore, BreakerSnapshot, BreakerState, BreakerTransition,
};
use crate::clock::{Clock, SystemClock};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Per-proxy circuit breaker guarded by a `tokio::sync::Mutex`.
///
/// As with the sync shape, `should_attempt` takes the exclusive lock: the
/// open-to-half-open step and the probe flag must be checked and set
/// atomically.
#[derive(Debug)]
pub struct AsyncCircuitBreaker {
    inner: Mutex<BreakerCore>,
}

impl AsyncCircuitBreaker {
    pub fn new(proxy_id: Uuid) -> Self {
        Self::with_config(proxy_id, BreakerConfig::default())
    }

    pub fn with_config(proxy_id: Uuid, config: BreakerConfig) -> Self {
        Self { inner: Mutex::new(BreakerCore::new(proxy_id, config, Arc::new(SystemClock))) }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.inner.get_mut().set_clock(clock);
        self
    }

    /// Rebuild a breaker from a persisted snapshot.
    pub fn restore(snapshot: BreakerSnapshot, clock: Arc<dyn Clock>) -> Self {
        Self { inner: Mutex::new(BreakerCore::restore(snapshot, clock)) }
    }

    pub async fn record_failure(&self) -> Option<BreakerTransition> {
        self.inner.lock().await.record_failure()
    }

    pub async fn record_success(&self) -> Option<BreakerTransition> {
        self.inner.lock().await.record_success()
    }

    pub async fn should_attempt(&self) -> Admission {
        self.inner.lock().await.should_attempt()
    }

    pub async fn reset(&self) -> Option<BreakerTransition> {
        self.inner.lock().await.reset()
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state()
    }

    pub async fn failure_count(&self) -> usize {
        self.inner.lock().await.failure_count()
    }

    pub async fn config(&self) -> BreakerConfig {
        self.inner.lock().await.config()
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        self.inner.lock().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn breaker_with_clock() -> (AsyncCircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let config = BreakerConfig {
            failure_threshold: 2,
            window: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(1),
        };
        let breaker = AsyncCircuitBreaker::with_config(Uuid::new_v4(), config)
            .with_clock(Arc::new(clock.clone()));
        (breaker, clock)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_recovery_cycle() {
        let (breaker, clock) = breaker_with_clock();

        assert!(breaker.record_failure().await.is_none());
        let opened = breaker.record_failure().await.expect("second failure opens");
        assert_eq!(opened.to, BreakerState::Open);
        assert!(!breaker.should_attempt().await.allowed);

        clock.advance(1_000);
        let admission = breaker.should_attempt().await;
        assert!(admission.allowed);
        assert_eq!(admission.transition.unwrap().to, BreakerState::HalfOpen);

        let closed = breaker.record_success().await.expect("probe success closes");
        assert_eq!(closed.to, BreakerState::Closed);
        assert_eq!(breaker.failure_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_tasks_admit_a_single_probe() {
        let (breaker, clock) = breaker_with_clock();
        breaker.record_failure().await;
        breaker.record_failure().await;
        clock.advance(1_000);

        let breaker = Arc::new(breaker);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                tokio::spawn(async move { breaker.should_attempt().await.allowed })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap_or(&false))
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_reopens_admission() {
        let (breaker, _clock) = breaker_with_clock();
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert!(!breaker.should_attempt().await.allowed);

        let transition = breaker.reset().await.expect("reset from open transitions");
        assert_eq!(transition.to, BreakerState::Closed);
        assert!(breaker.should_attempt().await.allowed);
    }
}
