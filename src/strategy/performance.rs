//! Performance-scored selection.

use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};
use chrono::{DateTime, Utc};

/// Scores each candidate as `0.7 * success_rate + 0.3 * (1 - normalized
/// latency)`, where latency is min-max normalized across the candidate set.
/// A candidate matching the caller's target region gets a 1.1x boost capped
/// at 1.0. Ties break toward the oldest `last_failure_at`, then id order.
#[derive(Debug, Default)]
pub struct PerformanceBasedStrategy;

const SUCCESS_WEIGHT: f64 = 0.7;
const LATENCY_WEIGHT: f64 = 0.3;
const REGION_BOOST: f64 = 1.1;

impl PerformanceBasedStrategy {
    pub fn new() -> Self {
        Self
    }

    fn score(proxy: &Proxy, min_latency: f64, max_latency: f64, target_region: Option<&str>) -> f64 {
        let normalized_latency = if max_latency > min_latency && proxy.total_successes > 0 {
            (proxy.average_response_time_ms - min_latency) / (max_latency - min_latency)
        } else {
            0.0
        };

        let mut score =
            SUCCESS_WEIGHT * proxy.success_rate() + LATENCY_WEIGHT * (1.0 - normalized_latency);

        if let Some(target) = target_region {
            if region_matches(proxy, target) {
                score = (score * REGION_BOOST).min(1.0);
            }
        }
        score
    }
}

fn region_matches(proxy: &Proxy, target: &str) -> bool {
    proxy.region.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(target))
        || proxy.country_code.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(target))
}

impl RotationStrategy for PerformanceBasedStrategy {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn select<'a>(&self, candidates: &'a [Proxy], ctx: &SelectionContext<'_>) -> Option<&'a Proxy> {
        if candidates.is_empty() {
            return None;
        }

        let latencies: Vec<f64> = candidates
            .iter()
            .filter(|p| p.total_successes > 0)
            .map(|p| p.average_response_time_ms)
            .collect();
        let min_latency = latencies.iter().copied().fold(f64::INFINITY, f64::min);
        let max_latency = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        candidates.iter().max_by(|a, b| {
            let score_a = Self::score(a, min_latency, max_latency, ctx.target_region);
            let score_b = Self::score(b, min_latency, max_latency, ctx.target_region);
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                // max_by keeps the later element on ties, so order the tie
                // breaks in reverse: older failure (and smaller id) must
                // compare as the "greater" pick.
                .then_with(|| tie_rank(b.last_failure_at).cmp(&tie_rank(a.last_failure_at)))
                .then_with(|| b.id.cmp(&a.id))
        })
    }
}

fn tie_rank(at: Option<DateTime<Utc>>) -> (bool, Option<DateTime<Utc>>) {
    // Never-failed sorts before any timestamp.
    (at.is_some(), at)
}
