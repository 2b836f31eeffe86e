//! PII Rules - bundle model, compiler and rule store
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  compile()  ┌─────────────────┐  swap()  ┌─────────────┐
//! │  RuleBundle  │────────────►│ CompiledRuleset │─────────►│  RuleStore  │
//! │ (versioned,  │             │  RegexSet +     │          │ active/prev │
//! │  immutable)  │             │  Aho-Corasick   │          │  (ArcSwap)  │
//! └──────────────┘             │  per category,  │          └──────┬──────┘
//!                              │  selector index │                 │ snapshot()
//!                              └─────────────────┘                 ▼
//!                                                          request-path scanners
//! ```
//!
//! A reload either activates a fully compiled ruleset or leaves the previous
//! one in place; the store never exposes a partially built ruleset.

#![warn(missing_docs)]

pub mod bundle;
pub mod checksum;
pub mod compiler;
pub mod selector;
pub mod store;

pub use bundle::{MaskStyle, PartialMask, PatternDef, RuleBundle, RuleSpec};
pub use checksum::Validator;
pub use compiler::{
    compile, compile_with, CategoryMatcher, CompileError, CompileErrorKind, CompileOptions,
    CompiledRule, CompiledRuleset, RawMatch,
};
pub use selector::{FieldPolicy, FieldSelector};
pub use store::{RuleStore, SwapOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PII category a rule detects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Personal names
    Name,
    /// Email addresses
    Email,
    /// Phone numbers
    Phone,
    /// National identifiers (SSN, Aadhaar, ...)
    NationalId,
    /// Passport numbers
    Passport,
    /// Payment card and account numbers
    Payment,
    /// Postal addresses
    Address,
    /// IP addresses
    IpAddress,
    /// Hardware / device identifiers
    DeviceId,
    /// UPI / payment handles
    Upi,
    /// Dates of birth
    DateOfBirth,
}

impl Category {
    /// All recognized categories
    pub const ALL: [Category; 11] = [
        Category::Name,
        Category::Email,
        Category::Phone,
        Category::NationalId,
        Category::Passport,
        Category::Payment,
        Category::Address,
        Category::IpAddress,
        Category::DeviceId,
        Category::Upi,
        Category::DateOfBirth,
    ];

    /// Stable label used in events and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::NationalId => "national_id",
            Self::Passport => "passport",
            Self::Payment => "payment",
            Self::Address => "address",
            Self::IpAddress => "ip_address",
            Self::DeviceId => "device_id",
            Self::Upi => "upi",
            Self::DateOfBirth => "date_of_birth",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let category = match normalized.as_str() {
            "name" | "full_name" => Self::Name,
            "email" => Self::Email,
            "phone" | "mobile" => Self::Phone,
            "national_id" | "id" | "ssn" | "aadhaar" => Self::NationalId,
            "passport" => Self::Passport,
            "payment" | "credit_card" | "card" | "iban" => Self::Payment,
            "address" => Self::Address,
            "ip_address" | "ip" => Self::IpAddress,
            "device_id" | "device" => Self::DeviceId,
            "upi" | "upi_id" => Self::Upi,
            "date_of_birth" | "dob" => Self::DateOfBirth,
            _ => return Err(s.to_string()),
        };
        Ok(category)
    }
}

/// Rule severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Severity {
    /// Informational
    Info = 0,
    /// Low risk
    Low = 1,
    /// Medium risk
    Medium = 2,
    /// High risk
    High = 3,
    /// Critical risk
    Critical = 4,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

/// How a matched span is rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionAction {
    /// Replace with the fixed `[REDACTED]` marker
    #[serde(alias = "redact-full", alias = "full")]
    RedactFull,
    /// Replace with the category's partial mask
    #[serde(alias = "redact-partial", alias = "partial")]
    RedactPartial,
    /// Replace with a short salted digest preview
    #[serde(alias = "hash-preview", alias = "hash")]
    HashPreview,
}

impl RedactionAction {
    /// Stable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RedactFull => "redact_full",
            Self::RedactPartial => "redact_partial",
            Self::HashPreview => "hash_preview",
        }
    }
}

impl Default for RedactionAction {
    fn default() -> Self {
        Self::RedactFull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_aliases() {
        assert_eq!("ssn".parse::<Category>(), Ok(Category::NationalId));
        assert_eq!("IP".parse::<Category>(), Ok(Category::IpAddress));
        assert_eq!("credit-card".parse::<Category>(), Ok(Category::Payment));
        assert!("favourite_colour".parse::<Category>().is_err());
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
    }

    #[test]
    fn test_action_aliases() {
        let action: RedactionAction = serde_json::from_str("\"redact-partial\"").unwrap();
        assert_eq!(action, RedactionAction::RedactPartial);
        let action: RedactionAction = serde_json::from_str("\"hash_preview\"").unwrap();
        assert_eq!(action, RedactionAction::HashPreview);
    }
}
