//! Proxy rotation strategies.
//!
//! A strategy picks one proxy from the set of currently eligible candidates
//! (the façade has already dropped expired proxies, proxies whose breaker
//! refuses admission, and any excluded proxy). Strategies are trait objects
//! behind an atomic slot so the façade can hot-swap them under load.

mod geo;
mod least_used;
mod performance;
mod random;
mod round_robin;
mod session;
mod weighted;

pub use geo::GeoTargetedStrategy;
pub use least_used::LeastUsedStrategy;
pub use performance::PerformanceBasedStrategy;
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use session::SessionPersistenceStrategy;
pub use weighted::WeightedStrategy;

use crate::error::RotatorError;
use crate::proxy::Proxy;
use std::fmt;
use std::str::FromStr;

/// Per-request hints consulted by strategies.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    /// Opaque key binding requests to one proxy (session persistence).
    pub session_key: Option<&'a str>,
    /// Region hint for geo-targeted selection and performance boosts.
    pub target_region: Option<&'a str>,
}

/// Selection algorithm over a non-empty candidate set.
pub trait RotationStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Pick one proxy from `candidates`. Returns `None` only when the
    /// candidate set is empty.
    fn select<'a>(&self, candidates: &'a [Proxy], ctx: &SelectionContext<'_>) -> Option<&'a Proxy>;

    /// Feed an observed outcome back into strategy-local state. Strategies
    /// without local state keep the default no-op.
    fn record_result(&self, _proxy: &Proxy, _success: bool, _response_time_ms: f64) {}
}

/// The named strategy variants, for string-driven construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    Random,
    Weighted,
    LeastUsed,
    Performance,
    Session,
    Geo,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::RoundRobin,
        StrategyKind::Random,
        StrategyKind::Weighted,
        StrategyKind::LeastUsed,
        StrategyKind::Performance,
        StrategyKind::Session,
        StrategyKind::Geo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round-robin",
            StrategyKind::Random => "random",
            StrategyKind::Weighted => "weighted",
            StrategyKind::LeastUsed => "least-used",
            StrategyKind::Performance => "performance",
            StrategyKind::Session => "session",
            StrategyKind::Geo => "geo",
        }
    }

    /// Instantiate the variant with its defaults. Session persistence and
    /// geo targeting compose over round-robin when built by name.
    pub fn build(&self) -> Box<dyn RotationStrategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
            StrategyKind::Random => Box::new(RandomStrategy::new()),
            StrategyKind::Weighted => Box::new(WeightedStrategy::new()),
            StrategyKind::LeastUsed => Box::new(LeastUsedStrategy::new()),
            StrategyKind::Performance => Box::new(PerformanceBasedStrategy::new()),
            StrategyKind::Session => {
                Box::new(SessionPersistenceStrategy::new(Box::new(RoundRobinStrategy::new())))
            }
            StrategyKind::Geo => {
                Box::new(GeoTargetedStrategy::new(None, Box::new(RoundRobinStrategy::new())))
            }
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RotatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                RotatorError::invalid_config(format!(
                    "unknown strategy: {s} (valid options: {})",
                    names.join(", ")
                ))
            })
    }
}
