//! Circuit breaker state machine, shared by the sync and async shapes.
//!
//! The core holds no lock; the wrapping types serialize access. Every state
//! change is returned to the caller as a [`BreakerTransition`] so it can be
//! forwarded to metrics and the optional storage collaborator.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation; the proxy is eligible for selection.
    Closed,
    /// The proxy is excluded from rotation until the probe deadline.
    Open,
    /// One tentative request decides between closing and re-opening.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the rolling window before the circuit opens.
    pub failure_threshold: usize,
    /// Rolling window over which failures are counted.
    pub window: Duration,
    /// How long the circuit stays open before admitting a probe.
    pub probe_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

/// One breaker state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTransition {
    pub proxy_id: Uuid,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    /// Failures in the window at the moment of the transition.
    pub failure_count: usize,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Present when the check itself moved the state (open -> half-open).
    pub transition: Option<BreakerTransition>,
}

/// Serializable breaker state for the storage collaborator.
///
/// Failure timestamps are clock milliseconds (epoch milliseconds under the
/// system clock), matching the deque the breaker keeps internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub proxy_id: Uuid,
    pub state: BreakerState,
    pub failure_timestamps: Vec<u64>,
    pub next_probe_at: Option<u64>,
    pub config: BreakerConfig,
    pub last_transition_at: DateTime<Utc>,
}

pub(crate) struct BreakerCore {
    proxy_id: Uuid,
    state: BreakerState,
    failures: VecDeque<u64>,
    config: BreakerConfig,
    next_probe_at: Option<u64>,
    half_open_in_flight: bool,
    last_transition_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BreakerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerCore")
            .field("proxy_id", &self.proxy_id)
            .field("state", &self.state)
            .field("failures_in_window", &self.failures.len())
            .field("next_probe_at", &self.next_probe_at)
            .finish()
    }
}

impl BreakerCore {
    pub(crate) fn new(proxy_id: Uuid, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now_utc = clock.now_utc();
        Self {
            proxy_id,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            config,
            next_probe_at: None,
            half_open_in_flight: false,
            last_transition_at: now_utc,
            clock,
        }
    }

    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub(crate) fn state(&self) -> BreakerState {
        self.state
    }

    pub(crate) fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Failures currently inside the rolling window.
    pub(crate) fn failure_count(&mut self) -> usize {
        let now = self.clock.now_millis();
        self.prune(now);
        self.failures.len()
    }

    pub(crate) fn record_failure(&mut self) -> Option<BreakerTransition> {
        let now = self.clock.now_millis();
        self.prune(now);
        self.failures.push_back(now);

        match self.state {
            BreakerState::Closed if self.failures.len() >= self.config.failure_threshold => {
                Some(self.open(now))
            }
            BreakerState::HalfOpen => {
                // Probe failed; back to open with a fresh probe deadline.
                self.half_open_in_flight = false;
                Some(self.open(now))
            }
            _ => None,
        }
    }

    pub(crate) fn record_success(&mut self) -> Option<BreakerTransition> {
        match self.state {
            BreakerState::HalfOpen => {
                self.half_open_in_flight = false;
                Some(self.close())
            }
            _ => None,
        }
    }

    /// Admission check. This mutates: an open breaker past its probe
    /// deadline transitions to half-open and admits the caller as the sole
    /// probe, so the check must run under the same exclusive lock as the
    /// recorders.
    pub(crate) fn should_attempt(&mut self) -> Admission {
        let now = self.clock.now_millis();
        match self.state {
            BreakerState::Closed => Admission { allowed: true, transition: None },
            BreakerState::Open => {
                if self.next_probe_at.is_some_and(|at| now >= at) {
                    let transition = self.half_open();
                    self.half_open_in_flight = true;
                    Admission { allowed: true, transition: Some(transition) }
                } else {
                    Admission { allowed: false, transition: None }
                }
            }
            BreakerState::HalfOpen => {
                if self.half_open_in_flight {
                    Admission { allowed: false, transition: None }
                } else {
                    self.half_open_in_flight = true;
                    Admission { allowed: true, transition: None }
                }
            }
        }
    }

    pub(crate) fn reset(&mut self) -> Option<BreakerTransition> {
        self.half_open_in_flight = false;
        match self.state {
            BreakerState::Closed => {
                self.failures.clear();
                self.next_probe_at = None;
                None
            }
            _ => Some(self.close()),
        }
    }

    pub(crate) fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            proxy_id: self.proxy_id,
            state: self.state,
            failure_timestamps: self.failures.iter().copied().collect(),
            next_probe_at: self.next_probe_at,
            config: self.config,
            last_transition_at: self.last_transition_at,
        }
    }

    pub(crate) fn restore(snapshot: BreakerSnapshot, clock: Arc<dyn Clock>) -> Self {
        Self {
            proxy_id: snapshot.proxy_id,
            state: snapshot.state,
            failures: snapshot.failure_timestamps.into(),
            config: snapshot.config,
            next_probe_at: snapshot.next_probe_at,
            half_open_in_flight: false,
            last_transition_at: snapshot.last_transition_at,
            clock,
        }
    }

    fn prune(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.config.window.as_millis() as u64);
        while self.failures.front().is_some_and(|&ts| ts < cutoff) {
            self.failures.pop_front();
        }
    }

    fn open(&mut self, now: u64) -> BreakerTransition {
        let transition = self.transition_to(BreakerState::Open);
        self.next_probe_at = Some(now + self.config.probe_timeout.as_millis() as u64);
        tracing::warn!(
            proxy_id = %self.proxy_id,
            failures = transition.failure_count,
            "circuit breaker opened"
        );
        transition
    }

    fn half_open(&mut self) -> BreakerTransition {
        let transition = self.transition_to(BreakerState::HalfOpen);
        tracing::info!(proxy_id = %self.proxy_id, "circuit breaker half-open, admitting probe");
        transition
    }

    fn close(&mut self) -> BreakerTransition {
        let transition = self.transition_to(BreakerState::Closed);
        self.failures.clear();
        self.next_probe_at = None;
        tracing::info!(proxy_id = %self.proxy_id, "circuit breaker closed");
        transition
    }

    fn transition_to(&mut self, to: BreakerState) -> BreakerTransition {
        let at = self.clock.now_utc();
        let transition = BreakerTransition {
            proxy_id: self.proxy_id,
            from: self.state,
            to,
            at,
            failure_count: self.failures.len(),
        };
        self.state = to;
        self.last_transition_at = at;
        transition
    }
}

