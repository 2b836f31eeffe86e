//! PII Scanner - field-by-field JSON redaction
//!
//! The scanner parses a payload once, walks its scalar leaves in document
//! order and rewrites every span matched by the active ruleset. It honors the
//! request deadline itself: past the soft deadline only critical rules run,
//! past the hard deadline remaining values are redacted without scanning.
//!
//! Redaction is idempotent: existing `[REDACTED]` and `[HASH:…]` markers are
//! never matched again and every partial mask is a fixed point.

#![warn(missing_docs)]

pub mod redact;
pub mod scanner;
pub mod walker;

pub use redact::{apply_mask, hash_preview, REDACTED};
pub use scanner::{
    redact_all, redact_all_value, DegradedReason, DetectionEvent, ScanRequest, ScanResult,
    Scanner, ScannerConfig,
};
pub use walker::{Field, FieldWalker};
