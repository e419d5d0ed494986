//! Rate-limit gate and the optional bounded request queue.

use crate::error::RotatorError;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

/// Pluggable per-proxy rate gate, consulted before a selected proxy is used.
///
/// The crate ships no limiter implementation; embedders provide one. A
/// `false` from `check` either fails the request synchronously or, when
/// queueing is enabled, parks it in the FIFO queue.
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    fn check(&self, proxy_id: Uuid) -> bool;
}

/// Bounded FIFO of deferred requests.
///
/// Backpressure is synchronous: a full queue rejects immediately instead of
/// blocking the caller.
#[derive(Debug)]
pub struct RequestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::new()), capacity: capacity.max(1) }
    }

    pub fn push(&self, item: T) -> Result<(), RotatorError> {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            tracing::error!(capacity = self.capacity, "request queue full, rejecting");
            return Err(RotatorError::QueueFull { capacity: self.capacity });
        }
        items.push_back(item);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all queued requests; returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let count = items.len();
        items.clear();
        count
    }

    pub fn stats(&self) -> QueueStats {
        let len = self.lock().len();
        QueueStats {
            enabled: true,
            size: len,
            capacity: self.capacity,
            is_full: len >= self.capacity,
            is_empty: len == 0,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Queue occupancy snapshot.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub enabled: bool,
    pub size: usize,
    pub capacity: usize,
    pub is_full: bool,
    pub is_empty: bool,
}

impl QueueStats {
    /// Stats for a rotator with queueing disabled.
    pub fn disabled() -> Self {
        Self { enabled: false, size: 0, capacity: 0, is_full: false, is_empty: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let queue: RequestQueue<u32> = RequestQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn full_queue_rejects_synchronously() {
        let queue: RequestQueue<u32> = RequestQueue::new(2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let err = queue.push(3).unwrap_err();
        assert!(err.is_queue_full());
        assert!(queue.is_full());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn clear_reports_discarded_count() {
        let queue: RequestQueue<u32> = RequestQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn stats_reflect_occupancy() {
        let queue: RequestQueue<u32> = RequestQueue::new(2);
        assert_eq!(
            queue.stats(),
            QueueStats { enabled: true, size: 0, capacity: 2, is_full: false, is_empty: true }
        );

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        let stats = queue.stats();
        assert!(stats.is_full);
        assert!(!stats.is_empty);
        assert_eq!(stats.size, 2);

        assert!(!QueueStats::disabled().enabled);
    }
}
