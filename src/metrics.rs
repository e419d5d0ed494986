//! Attempt-level metrics: bounded ring, hourly rollups, breaker events.

use crate::breaker::{BreakerState, BreakerTransition};
use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Outcome of one request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
    CircuitOpen,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::CircuitOpen => "circuit_open",
        }
    }
}

/// One row of the request-attempt log.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub request_id: Uuid,
    pub attempt_number: u32,
    pub proxy_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub status_code: Option<u16>,
    /// Backoff applied before this attempt.
    pub delay_before: Duration,
    pub latency: Duration,
    pub error: Option<String>,
}

/// Roll-up of the attempts whose timestamps truncate to one hour.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyAggregate {
    pub hour: DateTime<Utc>,
    pub unique_requests: u64,
    pub total_attempts: u64,
    pub success_by_attempt: BTreeMap<u32, u64>,
    pub failure_by_reason: BTreeMap<String, u64>,
    pub avg_latency: Duration,
    #[serde(skip)]
    seen_requests: HashSet<Uuid>,
}

impl HourlyAggregate {
    fn new(hour: DateTime<Utc>) -> Self {
        Self {
            hour,
            unique_requests: 0,
            total_attempts: 0,
            success_by_attempt: BTreeMap::new(),
            failure_by_reason: BTreeMap::new(),
            avg_latency: Duration::ZERO,
            seen_requests: HashSet::new(),
        }
    }

    fn fold(&mut self, attempt: &AttemptRecord) {
        if self.seen_requests.insert(attempt.request_id) {
            self.unique_requests += 1;
        }
        self.total_attempts += 1;

        match attempt.outcome {
            AttemptOutcome::Success => {
                *self.success_by_attempt.entry(attempt.attempt_number).or_insert(0) += 1;
            }
            other => {
                let reason = attempt
                    .error
                    .clone()
                    .unwrap_or_else(|| other.as_str().to_string());
                *self.failure_by_reason.entry(reason).or_insert(0) += 1;
            }
        }

        // Running mean over every folded attempt.
        let n = self.total_attempts as f64;
        let mean = self.avg_latency.as_secs_f64()
            + (attempt.latency.as_secs_f64() - self.avg_latency.as_secs_f64()) / n;
        self.avg_latency = Duration::try_from_secs_f64(mean.max(0.0)).unwrap_or(Duration::ZERO);
    }
}

/// Aggregated totals across retained history.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_attempts: u64,
    pub success_by_attempt: BTreeMap<u32, u64>,
    pub failure_by_reason: BTreeMap<String, u64>,
    pub breaker_event_count: usize,
    pub retention_hours: u32,
}

/// One hour bucket in a time series.
#[derive(Debug, Clone, Serialize)]
pub struct TimeseriesPoint {
    pub hour: DateTime<Utc>,
    pub unique_requests: u64,
    pub total_attempts: u64,
    pub success_rate: f64,
    pub avg_latency: Duration,
}

/// Per-proxy attempt totals over a query window.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProxyAttemptStats {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency: Duration,
    pub breaker_opens: u64,
}

/// Metrics collector bounds.
#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    pub max_current_attempts: usize,
    pub retention_hours: u32,
    pub max_breaker_events: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_current_attempts: 10_000, retention_hours: 24, max_breaker_events: 1_000 }
    }
}

struct Inner {
    attempts: VecDeque<(u64, AttemptRecord)>,
    next_seq: u64,
    /// Sequence numbers `< folded_below` have been folded into `hourly`.
    folded_below: u64,
    hourly: BTreeMap<DateTime<Utc>, HourlyAggregate>,
    breaker_events: VecDeque<BreakerTransition>,
}

/// Thread-safe attempt log with periodic hourly rollup.
///
/// Every attempt is folded into its hour bucket exactly once: the
/// aggregation pass advances a sequence high-water mark instead of
/// re-reading the whole ring, and an attempt evicted from a full ring is
/// folded on its way out so no event is ever dropped from the rollups.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").field("config", &self.config).finish()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                attempts: VecDeque::new(),
                next_seq: 0,
                folded_below: 0,
                hourly: BTreeMap::new(),
                breaker_events: VecDeque::new(),
            }),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> MetricsConfig {
        self.config
    }

    /// Append an attempt; a full ring evicts (and folds) the oldest.
    pub fn record_attempt(&self, attempt: AttemptRecord) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.attempts.push_back((seq, attempt));

        while inner.attempts.len() > self.config.max_current_attempts {
            if let Some((evicted_seq, evicted)) = inner.attempts.pop_front() {
                if evicted_seq >= inner.folded_below {
                    let bucket = truncate_to_hour(evicted.timestamp);
                    inner.hourly.entry(bucket).or_insert_with(|| HourlyAggregate::new(bucket))
                        .fold(&evicted);
                    inner.folded_below = evicted_seq + 1;
                }
            }
        }
    }

    /// Append a breaker transition; the list keeps the newest events.
    pub fn record_breaker_event(&self, event: BreakerTransition) {
        let mut inner = self.lock();
        inner.breaker_events.push_back(event);
        while inner.breaker_events.len() > self.config.max_breaker_events {
            inner.breaker_events.pop_front();
        }
    }

    /// Fold not-yet-aggregated attempts into their hour buckets and evict
    /// buckets past retention.
    pub fn aggregate_hourly(&self) {
        let now = self.clock.now_utc();
        let mut inner = self.lock();
        self.aggregate_locked(&mut inner, now);
    }

    pub fn summary(&self) -> MetricsSummary {
        let now = self.clock.now_utc();
        let mut inner = self.lock();
        self.aggregate_locked(&mut inner, now);

        let mut success_by_attempt: BTreeMap<u32, u64> = BTreeMap::new();
        let mut failure_by_reason: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_attempts = 0;
        for aggregate in inner.hourly.values() {
            total_attempts += aggregate.total_attempts;
            for (attempt_number, count) in &aggregate.success_by_attempt {
                *success_by_attempt.entry(*attempt_number).or_insert(0) += count;
            }
            for (reason, count) in &aggregate.failure_by_reason {
                *failure_by_reason.entry(reason.clone()).or_insert(0) += count;
            }
        }

        MetricsSummary {
            total_attempts,
            success_by_attempt,
            failure_by_reason,
            breaker_event_count: inner.breaker_events.len(),
            retention_hours: self.config.retention_hours,
        }
    }

    /// One point per retained hour bucket within the window.
    pub fn timeseries(&self, hours: u32) -> Vec<TimeseriesPoint> {
        let now = self.clock.now_utc();
        let mut inner = self.lock();
        self.aggregate_locked(&mut inner, now);

        let cutoff = now - TimeDelta::hours(hours as i64);
        inner
            .hourly
            .values()
            .filter(|aggregate| aggregate.hour >= cutoff)
            .map(|aggregate| {
                let successes: u64 = aggregate.success_by_attempt.values().sum();
                let success_rate = if aggregate.total_attempts > 0 {
                    successes as f64 / aggregate.total_attempts as f64
                } else {
                    0.0
                };
                TimeseriesPoint {
                    hour: aggregate.hour,
                    unique_requests: aggregate.unique_requests,
                    total_attempts: aggregate.total_attempts,
                    success_rate,
                    avg_latency: aggregate.avg_latency,
                }
            })
            .collect()
    }

    /// Per-proxy totals over the window, from the live ring plus breaker
    /// open transitions.
    pub fn per_proxy(&self, hours: u32) -> BTreeMap<Uuid, ProxyAttemptStats> {
        let now = self.clock.now_utc();
        let cutoff = now - TimeDelta::hours(hours as i64);
        let inner = self.lock();

        let mut stats: BTreeMap<Uuid, ProxyAttemptStats> = BTreeMap::new();
        let mut latency_totals: BTreeMap<Uuid, f64> = BTreeMap::new();
        for (_, attempt) in &inner.attempts {
            if attempt.timestamp < cutoff {
                continue;
            }
            let entry = stats.entry(attempt.proxy_id).or_default();
            entry.total_attempts += 1;
            if attempt.outcome == AttemptOutcome::Success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            *latency_totals.entry(attempt.proxy_id).or_insert(0.0) +=
                attempt.latency.as_secs_f64();
        }
        for (proxy_id, entry) in stats.iter_mut() {
            if entry.total_attempts > 0 {
                let mean = latency_totals.get(proxy_id).copied().unwrap_or(0.0)
                    / entry.total_attempts as f64;
                entry.avg_latency = Duration::try_from_secs_f64(mean).unwrap_or(Duration::ZERO);
            }
        }

        for event in &inner.breaker_events {
            if event.at >= cutoff && event.to == BreakerState::Open {
                stats.entry(event.proxy_id).or_default().breaker_opens += 1;
            }
        }

        stats
    }

    /// Number of attempts currently held in the live ring.
    pub fn attempt_count(&self) -> usize {
        self.lock().attempts.len()
    }

    /// Recent breaker transitions, oldest first.
    pub fn breaker_events(&self) -> Vec<BreakerTransition> {
        self.lock().breaker_events.iter().cloned().collect()
    }

    fn aggregate_locked(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let folded_below = inner.folded_below;
        let mut pending: Vec<AttemptRecord> = inner
            .attempts
            .iter()
            .filter(|(seq, _)| *seq >= folded_below)
            .map(|(_, attempt)| attempt.clone())
            .collect();
        for attempt in pending.drain(..) {
            let bucket = truncate_to_hour(attempt.timestamp);
            inner.hourly.entry(bucket).or_insert_with(|| HourlyAggregate::new(bucket))
                .fold(&attempt);
        }
        inner.folded_below = inner.next_seq;

        let cutoff = truncate_to_hour(now - TimeDelta::hours(self.config.retention_hours as i64));
        inner.hourly.retain(|hour, _| *hour >= cutoff);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn truncate_to_hour(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.duration_trunc(TimeDelta::hours(1)).unwrap_or(timestamp)
}
