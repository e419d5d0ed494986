//! Round-robin selection.

use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cycles through candidates in order via a monotonically increasing
/// counter. Under concurrency a selection may observe a one-step stale
/// counter; that is the defined semantics.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RotationStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select<'a>(&self, candidates: &'a [Proxy], _ctx: &SelectionContext<'_>) -> Option<&'a Proxy> {
        if candidates.is_empty() {
            return None;
        }
        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        candidates.get(turn % candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::proxies;

    #[test]
    fn cycles_in_insertion_order() {
        let strategy = RoundRobinStrategy::new();
        let pool = proxies(3);
        let ctx = SelectionContext::default();

        let picks: Vec<&str> =
            (0..6).map(|_| strategy.select(&pool, &ctx).unwrap().host.as_str()).collect();
        assert_eq!(
            picks,
            vec![
                "proxy-0.example.com",
                "proxy-1.example.com",
                "proxy-2.example.com",
                "proxy-0.example.com",
                "proxy-1.example.com",
                "proxy-2.example.com",
            ]
        );
    }

    #[test]
    fn counter_survives_candidate_set_changes() {
        let strategy = RoundRobinStrategy::new();
        let ctx = SelectionContext::default();
        let pool = proxies(3);

        strategy.select(&pool, &ctx);
        strategy.select(&pool, &ctx);

        // A shrunken candidate set keeps rotating rather than resetting.
        let smaller = &pool[..2];
        let pick = strategy.select(smaller, &ctx).unwrap();
        assert_eq!(pick.host, "proxy-0.example.com");
    }

    #[test]
    fn empty_candidates_yield_none() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.select(&[], &SelectionContext::default()).is_none());
    }
}
