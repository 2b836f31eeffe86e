//! Concurrent wrapper around [`CircuitState`]

use crate::state::{CallOutcome, CircuitState, Transition, TransitionReason};
use crate::BreakerConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pii_common::ScanMode;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;

/// Published mode change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeTransition {
    /// Previous mode
    pub from: ScanMode,
    /// New mode
    pub to: ScanMode,
    /// Trigger
    pub reason: TransitionReason,
    /// Wall-clock time of the change
    pub at: DateTime<Utc>,
}

/// Point-in-time breaker view
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Current mode
    pub mode: ScanMode,
    /// Rolling p95 in microseconds
    pub p95_us: Option<u64>,
    /// Consecutive failures and timeouts
    pub consecutive_failures: u32,
    /// Samples in the rolling window
    pub samples: usize,
    /// Milliseconds spent in the current mode
    pub in_mode_ms: u64,
}

/// Process-wide mode controller.
///
/// The mode is readable without locking; outcomes are folded into the
/// rolling state under a short mutex.
pub struct ModeController {
    mode: AtomicU8,
    state: Mutex<CircuitState>,
    history: Mutex<VecDeque<ModeTransition>>,
    history_capacity: usize,
    event_tx: broadcast::Sender<ModeTransition>,
}

impl ModeController {
    /// Create controller in FULL mode
    pub fn new(config: BreakerConfig) -> Self {
        let (tx, _) = broadcast::channel(256);
        let history_capacity = config.history_capacity.max(1);
        Self {
            mode: AtomicU8::new(ScanMode::Full as u8),
            state: Mutex::new(CircuitState::new(config, Instant::now())),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            event_tx: tx,
        }
    }

    /// Current breaker mode
    #[inline(always)]
    pub fn mode(&self) -> ScanMode {
        ScanMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Mode for one request: the more degraded of breaker mode and hint.
    /// Callers cannot request passthrough; such hints are capped to
    /// critical-only.
    pub fn select(&self, hint: Option<ScanMode>) -> ScanMode {
        let breaker = self.mode();
        match hint {
            Some(hint) => breaker.max(hint.min(ScanMode::CriticalOnly)),
            None => breaker,
        }
    }

    /// Fold in one call outcome
    pub fn record(&self, outcome: CallOutcome) {
        let transition = {
            let mut state = self.state.lock();
            let transition = state.record(outcome, Instant::now());
            if let Some(t) = &transition {
                self.mode.store(t.to as u8, Ordering::Release);
            }
            transition
        };
        if let Some(t) = transition {
            self.publish(t);
        }
    }

    /// Degrade to passthrough because no ruleset is active
    pub fn force_passthrough(&self) {
        let transition = {
            let mut state = self.state.lock();
            let transition = state.force_passthrough(Instant::now());
            if let Some(t) = &transition {
                self.mode.store(t.to as u8, Ordering::Release);
            }
            transition
        };
        if let Some(t) = transition {
            self.publish(t);
        }
    }

    /// Re-evaluate without a new sample (lets an idle breaker recover)
    pub fn tick(&self) {
        let transition = {
            let mut state = self.state.lock();
            let transition = state.evaluate(Instant::now());
            if let Some(t) = &transition {
                self.mode.store(t.to as u8, Ordering::Release);
            }
            transition
        };
        if let Some(t) = transition {
            self.publish(t);
        }
    }

    /// Subscribe to transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ModeTransition> {
        self.event_tx.subscribe()
    }

    /// Most recent transitions, oldest first
    pub fn history(&self) -> Vec<ModeTransition> {
        self.history.lock().iter().cloned().collect()
    }

    /// Current rolling view
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            mode: state.mode(),
            p95_us: state.p95().map(|p| p.as_micros() as u64),
            consecutive_failures: state.consecutive_failures(),
            samples: state.sample_count(),
            in_mode_ms: state.mode_entered().elapsed().as_millis() as u64,
        }
    }

    fn publish(&self, transition: Transition) {
        let event = ModeTransition {
            from: transition.from,
            to: transition.to,
            reason: transition.reason,
            at: Utc::now(),
        };

        tracing::warn!(
            from = %event.from,
            to = %event.to,
            reason = event.reason.as_str(),
            "scan mode changed"
        );

        {
            let mut history = self.history.lock();
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let _ = self.event_tx.send(event);
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
