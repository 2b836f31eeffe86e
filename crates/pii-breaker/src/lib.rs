//! PII Breaker - decides how much scanning each request gets
//!
//! ```text
//!            p95 > threshold (sustained)        p95 > hard threshold (sustained)
//!            or failures >= N                   or failures >= M, or escalation
//!   ┌──────┐ ─────────────────────► ┌───────────────┐ ─────────────────────► ┌─────────────┐
//!   │ FULL │                        │ CRITICAL_ONLY │                        │ PASSTHROUGH │
//!   └──────┘ ◄───────────────────── └───────────────┘ ◄───────────────────── └─────────────┘
//!             healthy for recovery window          healthy for recovery window
//! ```
//!
//! [`CircuitState`] is the pure transition function; [`ModeController`]
//! wraps it for concurrent use by the scan service.

#![warn(missing_docs)]

pub mod controller;
pub mod state;

pub use controller::{BreakerSnapshot, ModeController, ModeTransition};
pub use state::{CallOutcome, CircuitState, Transition, TransitionReason};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Breaker thresholds and windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Rolling p95 above which FULL degrades
    pub p95_threshold_ms: u64,
    /// Rolling p95 above which CRITICAL_ONLY degrades
    pub hard_p95_threshold_ms: u64,
    /// How long a latency breach must persist
    pub sustain_window_ms: u64,
    /// Consecutive failures that degrade FULL
    pub failure_threshold: u32,
    /// Consecutive failures that degrade CRITICAL_ONLY
    pub hard_failure_threshold: u32,
    /// Unhealthy time in CRITICAL_ONLY before escalating
    pub escalation_window_ms: u64,
    /// Healthy time required for each step up
    pub recovery_window_ms: u64,
    /// Maximum latency samples kept
    pub window_samples: usize,
    /// Maximum sample age
    pub window_age_ms: u64,
    /// Transitions kept for inspection
    pub history_capacity: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            p95_threshold_ms: 8,
            hard_p95_threshold_ms: 25,
            sustain_window_ms: 2_000,
            failure_threshold: 5,
            hard_failure_threshold: 20,
            escalation_window_ms: 10_000,
            recovery_window_ms: 5_000,
            window_samples: 512,
            window_age_ms: 10_000,
            history_capacity: 64,
        }
    }
}

impl BreakerConfig {
    pub(crate) fn p95_threshold(&self) -> Duration {
        Duration::from_millis(self.p95_threshold_ms)
    }

    pub(crate) fn hard_p95_threshold(&self) -> Duration {
        Duration::from_millis(self.hard_p95_threshold_ms)
    }

    pub(crate) fn sustain_window(&self) -> Duration {
        Duration::from_millis(self.sustain_window_ms)
    }

    pub(crate) fn escalation_window(&self) -> Duration {
        Duration::from_millis(self.escalation_window_ms)
    }

    pub(crate) fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }

    pub(crate) fn window_age(&self) -> Duration {
        Duration::from_millis(self.window_age_ms)
    }
}
