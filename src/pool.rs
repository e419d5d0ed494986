//! Thread-safe proxy pool with snapshot reads and insertion order.

use crate::clock::{Clock, SystemClock};
use crate::proxy::{HealthStatus, Proxy, ProxySource};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Pool tuning: health derivation thresholds and the latency EMA factor.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Consecutive failures before a proxy is marked unhealthy.
    pub unhealthy_after: u32,
    /// Consecutive failures before a proxy is marked dead.
    pub dead_after: u32,
    /// Smoothing factor for the response-time EMA, in (0, 1].
    pub ema_alpha: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { unhealthy_after: 3, dead_after: 10, ema_alpha: 0.3 }
    }
}

/// Aggregate pool counts, as returned by [`ProxyPool::stats`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub total_proxies: usize,
    pub healthy_proxies: usize,
    pub unhealthy_proxies: usize,
    pub dead_proxies: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub average_success_rate: f64,
}

/// Mutable collection of proxies.
///
/// Readers always work from a snapshot; the backing store is never exposed,
/// so external iteration cannot race a writer. Insertion order is preserved
/// for deterministic round-robin.
#[derive(Debug)]
pub struct ProxyPool {
    proxies: RwLock<Vec<Proxy>>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ProxyPool {
    pub fn new(config: PoolConfig) -> Self {
        Self { proxies: RwLock::new(Vec::new()), config, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Point-in-time copy of the pool, in insertion order.
    pub fn snapshot(&self) -> Vec<Proxy> {
        self.read().clone()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.read().iter().any(|p| p.id == id)
    }

    pub fn get(&self, id: Uuid) -> Option<Proxy> {
        self.read().iter().find(|p| p.id == id).cloned()
    }

    /// Insert a proxy. Returns false (and leaves the pool unchanged) if a
    /// proxy with the same id is already present.
    pub fn add(&self, proxy: Proxy) -> bool {
        let mut proxies = self.write();
        if proxies.iter().any(|p| p.id == proxy.id) {
            return false;
        }
        proxies.push(proxy);
        true
    }

    pub fn remove(&self, id: Uuid) -> Option<Proxy> {
        let mut proxies = self.write();
        let index = proxies.iter().position(|p| p.id == id)?;
        Some(proxies.remove(index))
    }

    /// Remove every unhealthy or dead proxy; returns the removed ids.
    pub fn clear_unhealthy(&self) -> Vec<Uuid> {
        let mut proxies = self.write();
        let mut removed = Vec::new();
        proxies.retain(|p| {
            let keep = !matches!(p.health_status, HealthStatus::Unhealthy | HealthStatus::Dead);
            if !keep {
                removed.push(p.id);
            }
            keep
        });
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "cleared unhealthy proxies from pool");
        }
        removed
    }

    /// Count of proxies by source tag.
    pub fn source_breakdown(&self) -> BTreeMap<ProxySource, usize> {
        let mut counts = BTreeMap::new();
        for proxy in self.read().iter() {
            *counts.entry(proxy.source).or_insert(0) += 1;
        }
        counts
    }

    /// Record a successful attempt against a proxy, updating counters under
    /// the write lock so snapshot readers never see a half-applied update.
    pub fn record_success(&self, id: Uuid, latency_ms: f64) {
        let now = self.clock.now_utc();
        let mut proxies = self.write();
        if let Some(proxy) = proxies.iter_mut().find(|p| p.id == id) {
            proxy.record_success(latency_ms, self.config.ema_alpha, now);
        }
    }

    /// Record a failed attempt against a proxy.
    pub fn record_failure(&self, id: Uuid) {
        let now = self.clock.now_utc();
        let config = self.config;
        let mut proxies = self.write();
        if let Some(proxy) = proxies.iter_mut().find(|p| p.id == id) {
            proxy.record_failure(config.unhealthy_after, config.dead_after, now);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let snapshot = self.snapshot();

        let healthy = snapshot
            .iter()
            .filter(|p| {
                matches!(
                    p.health_status,
                    HealthStatus::Healthy | HealthStatus::Unknown | HealthStatus::Degraded
                )
            })
            .count();
        let unhealthy =
            snapshot.iter().filter(|p| p.health_status == HealthStatus::Unhealthy).count();
        let dead = snapshot.iter().filter(|p| p.health_status == HealthStatus::Dead).count();

        let rates: Vec<f64> =
            snapshot.iter().filter(|p| p.total_requests > 0).map(|p| p.success_rate()).collect();
        let average_success_rate = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        PoolStats {
            total_proxies: snapshot.len(),
            healthy_proxies: healthy,
            unhealthy_proxies: unhealthy,
            dead_proxies: dead,
            total_requests: snapshot.iter().map(|p| p.total_requests).sum(),
            total_successes: snapshot.iter().map(|p| p.total_successes).sum(),
            total_failures: snapshot.iter().map(|p| p.total_failures).sum(),
            average_success_rate,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Proxy>> {
        self.proxies.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Proxy>> {
        self.proxies.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
