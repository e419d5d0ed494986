//! Synchronous circuit breaker for the blocking execution shape.

use crate::breaker::core::{
    Admission, BreakerConfig, BreakerCore, BreakerSnapshot, BreakerState, BreakerTransition,
};
use crate::clock::{Clock, SystemClock};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Per-proxy circuit breaker guarded by a `std::sync::Mutex`.
///
/// All four operations take the exclusive lock, including
/// [`should_attempt`](CircuitBreaker::should_attempt): admission is a
/// read-then-modify step, and two callers must never both believe they are
/// the sole half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(proxy_id: Uuid) -> Self {
        Self::with_config(proxy_id, BreakerConfig::default())
    }

    pub fn with_config(proxy_id: Uuid, config: BreakerConfig) -> Self {
        Self { inner: Mutex::new(BreakerCore::new(proxy_id, config, Arc::new(SystemClock))) }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.lock().set_clock(clock);
        self
    }

    /// Rebuild a breaker from a persisted snapshot. Probe deadlines carry
    /// over; the half-open in-flight flag does not survive a restart.
    pub fn restore(snapshot: BreakerSnapshot, clock: Arc<dyn Clock>) -> Self {
        Self { inner: Mutex::new(BreakerCore::restore(snapshot, clock)) }
    }

    pub fn record_failure(&self) -> Option<BreakerTransition> {
        self.lock().record_failure()
    }

    pub fn record_success(&self) -> Option<BreakerTransition> {
        self.lock().record_success()
    }

    pub fn should_attempt(&self) -> Admission {
        self.lock().should_attempt()
    }

    pub fn reset(&self) -> Option<BreakerTransition> {
        self.lock().reset()
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state()
    }

    pub fn failure_count(&self) -> usize {
        self.lock().failure_count()
    }

    pub fn config(&self) -> BreakerConfig {
        self.lock().config()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.lock().snapshot()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
