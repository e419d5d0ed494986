//! Retry policy configuration: attempts, backoff, jitter, idempotency.

use crate::backoff::BackoffCurve;
use crate::error::RotatorError;
use rand::Rng;
use reqwest::Method;
use std::collections::BTreeSet;
use std::time::Duration;

/// Immutable retry configuration.
///
/// Build through [`RetryPolicy::builder`]; every bound is validated at the
/// setter so an out-of-range policy never reaches the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    curve: BackoffCurve,
    base_delay: Duration,
    multiplier: f64,
    max_backoff_delay: Duration,
    jitter: bool,
    retry_status_codes: BTreeSet<u16>,
    timeout: Option<Duration>,
    retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            curve: BackoffCurve::Exponential,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff_delay: Duration::from_secs(30),
            jitter: false,
            retry_status_codes: BTreeSet::from([502, 503, 504]),
            timeout: None,
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn curve(&self) -> BackoffCurve {
        self.curve
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_backoff_delay(&self) -> Duration {
        self.max_backoff_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn retry_status_codes(&self) -> &BTreeSet<u16> {
        &self.retry_status_codes
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry_non_idempotent(&self) -> bool {
        self.retry_non_idempotent
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    /// Delay before the retry with the given zero-indexed number.
    ///
    /// Without jitter this is the backoff curve clamped to the cap. With
    /// jitter enabled, delays use the AWS decorrelated scheme: each delay is
    /// drawn from `uniform(base_delay, previous * 3)` clamped to the cap, so
    /// independent callers retrying the same failing target drift apart. The
    /// first jittered delay is drawn from `uniform(0, curve value)`.
    pub fn calculate_delay(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let curve_value =
            self.curve.delay(self.base_delay, self.multiplier, attempt).min(self.max_backoff_delay);

        if !self.jitter {
            return curve_value;
        }

        let sampled = match previous {
            Some(previous) => {
                let lo = self.base_delay.as_secs_f64();
                let hi = previous.as_secs_f64() * 3.0;
                uniform_between(lo, hi)
            }
            None => uniform_between(0.0, curve_value.as_secs_f64()),
        };

        Duration::try_from_secs_f64(sampled)
            .unwrap_or(self.max_backoff_delay)
            .min(self.max_backoff_delay)
    }
}

fn uniform_between(a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if hi - lo <= f64::EPSILON {
        lo
    } else {
        rand::rng().random_range(lo..=hi)
    }
}

/// Check if an HTTP method is safe to retry without an explicit override.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE | Method::PUT)
}

/// Builder for [`RetryPolicy`]. Setters with bounds return `Err` on
/// violation so misconfiguration surfaces at construction time.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Total attempt budget, in `1..=10`.
    pub fn max_attempts(mut self, attempts: u32) -> Result<Self, RotatorError> {
        if !(1..=10).contains(&attempts) {
            return Err(RotatorError::invalid_config(format!(
                "max_attempts must be in 1..=10 (got {attempts})"
            )));
        }
        self.policy.max_attempts = attempts;
        Ok(self)
    }

    pub fn curve(mut self, curve: BackoffCurve) -> Self {
        self.policy.curve = curve;
        self
    }

    /// Base delay, in `(0, 60]` seconds.
    pub fn base_delay(mut self, delay: Duration) -> Result<Self, RotatorError> {
        if delay.is_zero() || delay > Duration::from_secs(60) {
            return Err(RotatorError::invalid_config(format!(
                "base_delay must be in (0, 60] seconds (got {delay:?})"
            )));
        }
        self.policy.base_delay = delay;
        Ok(self)
    }

    /// Exponential multiplier, in `(1, 10]`.
    pub fn multiplier(mut self, multiplier: f64) -> Result<Self, RotatorError> {
        if !(multiplier > 1.0 && multiplier <= 10.0) {
            return Err(RotatorError::invalid_config(format!(
                "multiplier must be in (1, 10] (got {multiplier})"
            )));
        }
        self.policy.multiplier = multiplier;
        Ok(self)
    }

    /// Backoff cap, in `(0, 300]` seconds.
    pub fn max_backoff_delay(mut self, delay: Duration) -> Result<Self, RotatorError> {
        if delay.is_zero() || delay > Duration::from_secs(300) {
            return Err(RotatorError::invalid_config(format!(
                "max_backoff_delay must be in (0, 300] seconds (got {delay:?})"
            )));
        }
        self.policy.max_backoff_delay = delay;
        Ok(self)
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    /// Status codes that trigger a retry. Must all be 5xx.
    pub fn retry_status_codes(
        mut self,
        codes: impl IntoIterator<Item = u16>,
    ) -> Result<Self, RotatorError> {
        let codes: BTreeSet<u16> = codes.into_iter().collect();
        if let Some(bad) = codes.iter().find(|c| !(500..600).contains(*c)) {
            return Err(RotatorError::invalid_config(format!(
                "retry status codes must be 5xx (got {bad})"
            )));
        }
        self.policy.retry_status_codes = codes;
        Ok(self)
    }

    /// Whole-call budget covering every attempt and backoff sleep.
    pub fn timeout(mut self, timeout: Duration) -> Result<Self, RotatorError> {
        if timeout.is_zero() {
            return Err(RotatorError::invalid_config("timeout must be positive"));
        }
        self.policy.timeout = Some(timeout);
        Ok(self)
    }

    pub fn retry_non_idempotent(mut self, enabled: bool) -> Self {
        self.policy.retry_non_idempotent = enabled;
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}
