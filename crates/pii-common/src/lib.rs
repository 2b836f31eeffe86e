//! PII Gateway Common - Shared types for the redaction engine
//!
//! This crate provides the lock-free primitives every other crate in the
//! workspace builds on:
//! - Scan modes (the breaker's vocabulary)
//! - Atomic counters and latency histograms
//! - Request-level error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod metrics;

pub use error::*;
pub use metrics::{HistogramSnapshot, LatencyHistogram, LATENCY_BUCKETS_US};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// How much scanning work a request receives.
///
/// Variants are ordered by degradation: `Full < CriticalOnly < Passthrough`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ScanMode {
    /// Every applicable rule runs
    Full = 0,
    /// Only critical-flagged rules run
    CriticalOnly = 1,
    /// No matching; document forwarded with an unscanned marker
    Passthrough = 2,
}

impl ScanMode {
    /// Stable label used in logs, headers and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::CriticalOnly => "critical_only",
            Self::Passthrough => "passthrough",
        }
    }

    /// Decode from the atomic representation
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Full,
            1 => Self::CriticalOnly,
            _ => Self::Passthrough,
        }
    }

    /// One level less degraded, if any
    pub fn step_up(&self) -> Option<Self> {
        match self {
            Self::Full => None,
            Self::CriticalOnly => Some(Self::Full),
            Self::Passthrough => Some(Self::CriticalOnly),
        }
    }

    /// One level more degraded, if any
    pub fn step_down(&self) -> Option<Self> {
        match self {
            Self::Full => Some(Self::CriticalOnly),
            Self::CriticalOnly => Some(Self::Passthrough),
            Self::Passthrough => None,
        }
    }
}

impl Default for ScanMode {
    fn default() -> Self {
        Self::Full
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "critical_only" | "critical-only" | "critical" => Ok(Self::CriticalOnly),
            "passthrough" | "pass_through" => Ok(Self::Passthrough),
            other => Err(format!("unknown scan mode: {other}")),
        }
    }
}

/// High-performance counter for lock-free metrics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
