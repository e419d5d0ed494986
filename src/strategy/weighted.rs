//! Success-rate-weighted selection.

use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};
use rand::Rng;

/// Weighs each candidate by its explicit weight, falling back to the
/// observed success rate. When every weight is zero (a cold pool), the
/// choice degrades to uniform random.
#[derive(Debug, Default)]
pub struct WeightedStrategy;

impl WeightedStrategy {
    pub fn new() -> Self {
        Self
    }

    fn weight_of(proxy: &Proxy) -> f64 {
        proxy.weight.unwrap_or_else(|| proxy.success_rate()).max(0.0)
    }
}

impl RotationStrategy for WeightedStrategy {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select<'a>(&self, candidates: &'a [Proxy], _ctx: &SelectionContext<'_>) -> Option<&'a Proxy> {
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<f64> = candidates.iter().map(Self::weight_of).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return candidates.get(rand::rng().random_range(0..candidates.len()));
        }

        let mut remaining = rand::rng().random_range(0.0..total);
        for (proxy, weight) in candidates.iter().zip(&weights) {
            if remaining < *weight {
                return Some(proxy);
            }
            remaining -= weight;
        }
        // Floating point slack lands on the last weighted candidate.
        candidates.iter().zip(&weights).rev().find(|(_, w)| **w > 0.0).map(|(p, _)| p)
    }
}
