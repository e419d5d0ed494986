//! Backoff curves for the retry policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay between retry attempts.
///
/// `attempt` is the zero-indexed retry number: 0 is the first retry after
/// the first failure. The caller clamps the result to its configured cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffCurve {
    /// `base * multiplier^attempt`
    #[default]
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
    /// `base`
    Fixed,
}

impl BackoffCurve {
    /// Raw (un-jittered, un-capped) delay for the given retry number.
    /// Saturates instead of overflowing for large attempt counts.
    pub fn delay(&self, base: Duration, multiplier: f64, attempt: u32) -> Duration {
        let seconds = match self {
            BackoffCurve::Exponential => base.as_secs_f64() * multiplier.powi(attempt as i32),
            BackoffCurve::Linear => base.as_secs_f64() * (attempt as f64 + 1.0),
            BackoffCurve::Fixed => base.as_secs_f64(),
        };
        saturating_from_secs(seconds)
    }
}

fn saturating_from_secs(seconds: f64) -> Duration {
    if seconds.is_finite() {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::MAX
    }
}
