//! Rolling breaker state and its transition function

use crate::BreakerConfig;
use pii_common::ScanMode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of one scan call as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Completed within its deadline
    Success(Duration),
    /// Completed late or partially
    Timeout(Duration),
    /// Did not complete (rejected, faulted)
    Failure,
}

/// Why a transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// p95 above threshold for the sustain window
    LatencyBreach,
    /// Too many consecutive failures
    FailureThreshold,
    /// p95 above the hard threshold for the sustain window
    HardLatencyBreach,
    /// Consecutive failures reached the hard threshold
    HardFailureThreshold,
    /// Unhealthy for the whole escalation window
    Escalation,
    /// No compiled ruleset available
    NoActiveRuleset,
    /// Healthy for the recovery window
    Recovered,
}

impl TransitionReason {
    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LatencyBreach => "latency_breach",
            Self::FailureThreshold => "failure_threshold",
            Self::HardLatencyBreach => "hard_latency_breach",
            Self::HardFailureThreshold => "hard_failure_threshold",
            Self::Escalation => "escalation",
            Self::NoActiveRuleset => "no_active_ruleset",
            Self::Recovered => "recovered",
        }
    }
}

/// A mode change produced by the transition function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous mode
    pub from: ScanMode,
    /// New mode
    pub to: ScanMode,
    /// Trigger
    pub reason: TransitionReason,
}

/// Onset tracking: `Some(start)` while a condition holds
fn track(onset: &mut Option<Instant>, holds: bool, now: Instant) {
    if holds {
        onset.get_or_insert(now);
    } else {
        *onset = None;
    }
}

/// Breaker state. Every method takes `now` so the machine runs without a clock.
#[derive(Debug, Clone)]
pub struct CircuitState {
    config: BreakerConfig,
    samples: VecDeque<(Instant, Duration)>,
    consecutive_failures: u32,
    mode: ScanMode,
    mode_entered: Instant,
    breach_since: Option<Instant>,
    hard_breach_since: Option<Instant>,
    unhealthy_since: Option<Instant>,
    healthy_since: Option<Instant>,
}

impl CircuitState {
    /// Start in FULL
    pub fn new(config: BreakerConfig, now: Instant) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_samples.min(4096)),
            config,
            consecutive_failures: 0,
            mode: ScanMode::Full,
            mode_entered: now,
            breach_since: None,
            hard_breach_since: None,
            unhealthy_since: None,
            healthy_since: None,
        }
    }

    /// Current mode
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// When the current mode was entered
    pub fn mode_entered(&self) -> Instant {
        self.mode_entered
    }

    /// Consecutive failures and timeouts
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Samples currently in the rolling window
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Rolling p95 latency, if any samples are held
    pub fn p95(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut latencies: Vec<Duration> = self.samples.iter().map(|(_, l)| *l).collect();
        latencies.sort_unstable();
        let rank = ((latencies.len() as f64) * 0.95).ceil() as usize;
        latencies.get(rank.saturating_sub(1)).copied()
    }

    /// Record one call and re-evaluate
    pub fn record(&mut self, outcome: CallOutcome, now: Instant) -> Option<Transition> {
        match outcome {
            CallOutcome::Success(latency) => {
                self.push_sample(latency, now);
                self.consecutive_failures = 0;
            }
            CallOutcome::Timeout(latency) => {
                self.push_sample(latency, now);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
            CallOutcome::Failure => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
        self.evaluate(now)
    }

    /// Drop to PASSTHROUGH because no ruleset is available. Recovery restarts.
    pub fn force_passthrough(&mut self, now: Instant) -> Option<Transition> {
        self.healthy_since = None;
        if self.mode == ScanMode::Passthrough {
            return None;
        }
        Some(self.enter(ScanMode::Passthrough, TransitionReason::NoActiveRuleset, now))
    }

    /// Re-evaluate thresholds; at most one step per call
    pub fn evaluate(&mut self, now: Instant) -> Option<Transition> {
        self.prune(now);

        let p95 = self.p95();
        let breach = p95.is_some_and(|p| p > self.config.p95_threshold());
        let hard_breach = p95.is_some_and(|p| p > self.config.hard_p95_threshold());
        let healthy = !breach && self.consecutive_failures == 0;

        track(&mut self.breach_since, breach, now);
        track(&mut self.hard_breach_since, hard_breach, now);
        track(&mut self.unhealthy_since, !healthy, now);
        track(&mut self.healthy_since, healthy, now);

        // Durations are measured inside the current mode only.
        let entered = self.mode_entered;
        let held = |onset: Option<Instant>, window: Duration| {
            onset.is_some_and(|t| now.saturating_duration_since(t.max(entered)) >= window)
        };

        let degrade = match self.mode {
            ScanMode::Full => {
                if held(self.breach_since, self.config.sustain_window()) {
                    Some(TransitionReason::LatencyBreach)
                } else if self.consecutive_failures >= self.config.failure_threshold {
                    Some(TransitionReason::FailureThreshold)
                } else {
                    None
                }
            }
            ScanMode::CriticalOnly => {
                if held(self.hard_breach_since, self.config.sustain_window()) {
                    Some(TransitionReason::HardLatencyBreach)
                } else if self.consecutive_failures >= self.config.hard_failure_threshold {
                    Some(TransitionReason::HardFailureThreshold)
                } else if held(self.unhealthy_since, self.config.escalation_window()) {
                    Some(TransitionReason::Escalation)
                } else {
                    None
                }
            }
            ScanMode::Passthrough => None,
        };

        if let Some(reason) = degrade {
            let to = self.mode.step_down()?;
            return Some(self.enter(to, reason, now));
        }

        if held(self.healthy_since, self.config.recovery_window()) {
            let to = self.mode.step_up()?;
            return Some(self.enter(to, TransitionReason::Recovered, now));
        }

        None
    }

    fn enter(&mut self, to: ScanMode, reason: TransitionReason, now: Instant) -> Transition {
        let from = self.mode;
        self.mode = to;
        self.mode_entered = now;
        Transition { from, to, reason }
    }

    fn push_sample(&mut self, latency: Duration, now: Instant) {
        self.samples.push_back((now, latency));
        while self.samples.len() > self.config.window_samples.max(1) {
            self.samples.pop_front();
        }
    }

    fn prune(&mut self, now: Instant) {
        let max_age = self.config.window_age();
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > max_age {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
