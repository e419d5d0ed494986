//! Per-proxy circuit breakers.
//!
//! One breaker exists per proxy, keyed by proxy id. The state machine lives
//! in [`core`]; [`CircuitBreaker`] and [`AsyncCircuitBreaker`] differ only
//! in how they serialize access to it.

mod core;
mod sync;
mod tokio;

pub use self::core::{
    Admission, BreakerConfig, BreakerSnapshot, BreakerState, BreakerTransition,
};
pub use self::sync::CircuitBreaker;
pub use self::tokio::AsyncCircuitBreaker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Registry of breakers keyed by proxy id.
///
/// Created and destroyed together with pool entries; shared between the
/// façade and the retry executor.
#[derive(Debug)]
pub struct BreakerRegistry<B> {
    inner: Mutex<HashMap<Uuid, Arc<B>>>,
}

impl<B> Default for BreakerRegistry<B> {
    fn default() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }
}

impl<B> BreakerRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker, replacing any previous entry for the id.
    pub fn register(&self, id: Uuid, breaker: Arc<B>) {
        self.lock().insert(id, breaker);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<B>> {
        self.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<B>> {
        self.lock().remove(&id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All registered breakers, for state snapshots.
    pub fn entries(&self) -> Vec<(Uuid, Arc<B>)> {
        self.lock().iter().map(|(id, b)| (*id, Arc::clone(b))).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<B>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
