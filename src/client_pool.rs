//! Bounded LRU cache of per-proxy HTTP clients.
//!
//! Each cached client owns the connection pool toward one proxy. Recency is
//! an explicit list next to the map: touching an entry moves its id to the
//! MRU end, eviction pops from the LRU end. All mutations run under one
//! mutex, eviction included.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

type EvictHook<C> = Box<dyn Fn(Uuid, C) + Send + Sync>;

struct PoolInner<C> {
    clients: HashMap<Uuid, C>,
    recency: VecDeque<Uuid>,
}

/// LRU-bounded mapping of proxy id to client.
///
/// Generic over the client type: the async rotator caches `reqwest::Client`,
/// the blocking rotator `reqwest::blocking::Client` (both are cheap handle
/// clones). Dropping a client closes its connections; the optional evict
/// hook makes that observable.
pub struct ClientPool<C> {
    inner: Mutex<PoolInner<C>>,
    capacity: usize,
    on_evict: Option<EvictHook<C>>,
}

impl<C> std::fmt::Debug for ClientPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

pub const DEFAULT_CLIENT_POOL_CAPACITY: usize = 100;

impl<C> Default for ClientPool<C> {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_POOL_CAPACITY)
    }
}

impl<C> ClientPool<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner { clients: HashMap::new(), recency: VecDeque::new() }),
            capacity: capacity.max(1),
            on_evict: None,
        }
    }

    /// Observe evicted clients (close bookkeeping, tests).
    pub fn with_evict_hook(mut self, hook: impl Fn(Uuid, C) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(hook));
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().clients.is_empty()
    }

    pub fn contains(&self, proxy_id: Uuid) -> bool {
        self.lock().clients.contains_key(&proxy_id)
    }

    /// Ids from least to most recently used.
    pub fn recency_order(&self) -> Vec<Uuid> {
        self.lock().recency.iter().copied().collect()
    }

    /// Remove and return the client for a proxy. The caller drops it, which
    /// closes its connections.
    pub fn remove(&self, proxy_id: Uuid) -> Option<C> {
        let mut inner = self.lock();
        inner.recency.retain(|id| *id != proxy_id);
        let client = inner.clients.remove(&proxy_id);
        if client.is_some() {
            tracing::debug!(%proxy_id, "removed client from pool");
        }
        client
    }

    /// Drop every cached client. Returns how many were closed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.clients.len();
        inner.recency.clear();
        inner.clients.clear();
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<C>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Clone> ClientPool<C> {
    /// Cached client for a proxy, touched as most recently used.
    pub fn get(&self, proxy_id: Uuid) -> Option<C> {
        let mut inner = self.lock();
        let client = inner.clients.get(&proxy_id).cloned()?;
        touch(&mut inner.recency, proxy_id);
        Some(client)
    }

    /// Cached client or a freshly built one. A new entry evicts from the
    /// LRU end once the pool is at capacity.
    pub fn get_or_try_create<E>(
        &self,
        proxy_id: Uuid,
        build: impl FnOnce() -> Result<C, E>,
    ) -> Result<C, E> {
        let mut inner = self.lock();
        if let Some(client) = inner.clients.get(&proxy_id).cloned() {
            touch(&mut inner.recency, proxy_id);
            return Ok(client);
        }

        let client = build()?;
        while inner.clients.len() >= self.capacity {
            let Some(lru_id) = inner.recency.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.clients.remove(&lru_id) {
                tracing::debug!(
                    evicted_proxy_id = %lru_id,
                    pool_size = inner.clients.len(),
                    "evicted least recently used client"
                );
                if let Some(hook) = &self.on_evict {
                    hook(lru_id, evicted);
                }
            }
        }

        inner.clients.insert(proxy_id, client.clone());
        inner.recency.push_back(proxy_id);
        Ok(client)
    }
}

fn touch(recency: &mut VecDeque<Uuid>, proxy_id: Uuid) {
    if let Some(pos) = recency.iter().position(|id| *id == proxy_id) {
        recency.remove(pos);
    }
    recency.push_back(proxy_id);
}
