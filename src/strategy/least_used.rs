//! Least-used selection.

use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};
use chrono::{DateTime, Utc};

/// Picks the candidate with the fewest total requests. Ties break toward
/// the oldest `last_success_at` (never-succeeded counts as oldest), then
/// deterministic id order.
#[derive(Debug, Default)]
pub struct LeastUsedStrategy;

impl LeastUsedStrategy {
    pub fn new() -> Self {
        Self
    }

    fn sort_key(proxy: &Proxy) -> (u64, Option<DateTime<Utc>>, uuid::Uuid) {
        // `None < Some(_)` in Option's ordering, so never-succeeded sorts first.
        (proxy.total_requests, proxy.last_success_at, proxy.id)
    }
}

impl RotationStrategy for LeastUsedStrategy {
    fn name(&self) -> &'static str {
        "least-used"
    }

    fn select<'a>(&self, candidates: &'a [Proxy], _ctx: &SelectionContext<'_>) -> Option<&'a Proxy> {
        candidates.iter().min_by_key(|p| Self::sort_key(p))
    }
}
