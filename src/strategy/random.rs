//! Uniform random selection.

use crate::proxy::Proxy;
use crate::strategy::{RotationStrategy, SelectionContext};
use rand::Rng;

/// Picks uniformly at random from the candidates.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl RotationStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select<'a>(&self, candidates: &'a [Proxy], _ctx: &SelectionContext<'_>) -> Option<&'a Proxy> {
        if candidates.is_empty() {
            return None;
        }
        candidates.get(rand::rng().random_range(0..candidates.len()))
    }
}
