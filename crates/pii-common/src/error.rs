//! Error types for the scan path

use thiserror::Error;

/// Request-level scan error.
///
/// Only `OversizedPayload`, `MalformedDocument` and `CapacityExceeded` are
/// surfaced to callers; the remaining variants are absorbed into degraded
/// results by the service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Payload exceeds the configured size ceiling
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    OversizedPayload {
        /// Received size in bytes
        size: usize,
        /// Configured ceiling in bytes
        limit: usize,
    },

    /// Payload is not valid JSON
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Worker pool saturated
    #[error("scan capacity exceeded")]
    CapacityExceeded,

    /// Scan deadline passed before completion
    #[error("scan deadline exceeded")]
    DeadlineExceeded,

    /// No compiled ruleset has been activated yet
    #[error("no active ruleset")]
    NoActiveRuleset,
}

impl ScanError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::OversizedPayload { .. } => "oversized_payload",
            Self::MalformedDocument(_) => "malformed_document",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NoActiveRuleset => "no_active_ruleset",
        }
    }
}
