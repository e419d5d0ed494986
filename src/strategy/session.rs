//! Session-sticky selection.

use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Binds each session key to one proxy chosen by a base strategy.
///
/// Subsequent selections with the same key return the bound proxy while it
/// remains eligible; otherwise the session re-binds. Requests without a
/// session key pass straight through to the base strategy.
#[derive(Debug)]
pub struct SessionPersistenceStrategy {
    base: Box<dyn RotationStrategy>,
    bindings: Mutex<HashMap<String, Uuid>>,
}

impl SessionPersistenceStrategy {
    pub fn new(base: Box<dyn RotationStrategy>) -> Self {
        Self { base, bindings: Mutex::new(HashMap::new()) }
    }

    /// Number of live session bindings.
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop one session binding. Returns true if it existed.
    pub fn end_session(&self, session_key: &str) -> bool {
        self.lock().remove(session_key).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Uuid>> {
        self.bindings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RotationStrategy for SessionPersistenceStrategy {
    fn name(&self) -> &'static str {
        "session"
    }

    fn select<'a>(&self, candidates: &'a [Proxy], ctx: &SelectionContext<'_>) -> Option<&'a Proxy> {
        let Some(key) = ctx.session_key else {
            return self.base.select(candidates, ctx);
        };

        let mut bindings = self.lock();
        if let Some(bound) = bindings.get(key) {
            if let Some(proxy) = candidates.iter().find(|p| p.id == *bound) {
                return Some(proxy);
            }
            // Bound proxy is no longer eligible; fall through and re-bind.
        }

        let picked = self.base.select(candidates, ctx)?;
        bindings.insert(key.to_string(), picked.id);
        Some(picked)
    }

    fn record_result(&self, proxy: &Proxy, success: bool, response_time_ms: f64) {
        if !success {
            // Unstick every session bound to the failing proxy so the next
            // request re-binds to a working one.
            self.lock().retain(|_, bound| *bound != proxy.id);
        }
        self.base.record_result(proxy, success, response_time_ms);
    }
}
