//! Clock abstractions used by circuit breakers, metrics, and retry budgets.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// `now_millis` drives rolling windows and probe deadlines; `now_utc` stamps
/// attempt records and hourly buckets. The two views must advance together.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Both views share one offset, so advancing the clock moves breaker probe
/// deadlines and metrics bucket boundaries in lockstep.
#[derive(Debug, Clone)]
pub struct ManualClock {
    epoch: DateTime<Utc>,
    offset_millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self { epoch, offset_millis: Arc::new(AtomicU64::new(0)) }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance(&self, millis: u64) {
        self.offset_millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        let base = self.epoch.timestamp_millis().max(0) as u64;
        base + self.offset_millis.load(Ordering::SeqCst)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let offset = self.offset_millis.load(Ordering::SeqCst);
        self.epoch + TimeDelta::milliseconds(offset as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_views_agree() {
        let clock = SystemClock;
        let millis = clock.now_millis();
        let utc_millis = clock.now_utc().timestamp_millis() as u64;
        // Sampled a moment apart, the two views stay within a second.
        assert!(utc_millis.abs_diff(millis) < 1_000);
    }

    #[test]
    fn manual_clock_advances_both_views() {
        let clock = ManualClock::default();
        let m0 = clock.now_millis();
        let t0 = clock.now_utc();

        clock.advance(90_000);

        assert_eq!(clock.now_millis() - m0, 90_000);
        assert_eq!((clock.now_utc() - t0).num_milliseconds(), 90_000);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let other = clock.clone();
        clock.advance(500);
        assert_eq!(other.now_millis(), clock.now_millis());
    }
}
