use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Dispatch decision for a task against a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, dispatch normally.
    Allow,
    /// Breaker half-open; this task is the single probe.
    Probe,
    /// Breaker open (or a probe is already in flight); hold the task.
    Hold,
}

/// State transition reported so the caller can audit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    Closed,
}

#[derive(Debug)]
struct SourceState {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
    probe_in_flight: bool,
}

impl SourceState {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: Instant::now(),
            probe_in_flight: false,
        }
    }
}

/// Per-source circuit breakers. After `failure_threshold` consecutive
/// task failures against one source the breaker opens and dispatch for
/// that source is held for the cooldown window; afterwards exactly one
/// probe task is admitted before the breaker fully closes or reopens.
#[derive(Debug)]
pub struct CircuitBreakerSet {
    sources: HashMap<String, SourceState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakerSet {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            sources: HashMap::new(),
            threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    pub fn state(&self, source: &str) -> BreakerState {
        self.sources
            .get(source)
            .map(|s| s.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Decide whether a task against `source` may be dispatched now.
    pub fn admit(&mut self, source: &str, now: Instant) -> Admission {
        let Some(entry) = self.sources.get_mut(source) else {
            return Admission::Allow;
        };
        match entry.state {
            BreakerState::Closed => Admission::Allow,
            BreakerState::Open => {
                if now.duration_since(entry.opened_at) >= self.cooldown {
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Hold
                }
            }
            BreakerState::HalfOpen => {
                if entry.probe_in_flight {
                    Admission::Hold
                } else {
                    entry.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// A half-open probe was lost without a result (lease revoked,
    /// worker gone); allow the next candidate task to probe instead.
    pub fn abort_probe(&mut self, source: &str) {
        if let Some(entry) = self.sources.get_mut(source) {
            if entry.state == BreakerState::HalfOpen {
                entry.probe_in_flight = false;
            }
        }
    }

    pub fn record_success(&mut self, source: &str) -> Option<BreakerTransition> {
        let entry = self.sources.get_mut(source)?;
        entry.consecutive_failures = 0;
        match entry.state {
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Closed;
                entry.probe_in_flight = false;
                Some(BreakerTransition::Closed)
            }
            _ => None,
        }
    }

    pub fn record_failure(&mut self, source: &str, now: Instant) -> Option<BreakerTransition> {
        let entry = self
            .sources
            .entry(source.to_string())
            .or_insert_with(SourceState::new);
        match entry.state {
            BreakerState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = now;
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed; back to a full cooldown.
                entry.state = BreakerState::Open;
                entry.opened_at = now;
                entry.probe_in_flight = false;
                Some(BreakerTransition::Opened)
            }
            BreakerState::Open => None,
        }
    }
}
