//! Raw rule bundle as authored by the external rule authority

use crate::{Category, RedactionAction, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Versioned, immutable set of detection rules and field policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBundle {
    /// Monotonic bundle version; the store only activates newer versions
    pub version: u64,
    /// Reference to the issuer signature verified upstream
    #[serde(default)]
    pub signature_ref: Option<String>,
    /// Ordered rules; order is the final tie-break between overlapping matches
    pub rules: Vec<RuleSpec>,
    /// Field selectors that are never scanned
    #[serde(default)]
    pub deny_fields: Vec<String>,
    /// When non-empty, only matching fields are scanned
    #[serde(default)]
    pub allow_fields: Vec<String>,
    /// Partial-mask overrides keyed by category name
    #[serde(default)]
    pub masks: HashMap<String, PartialMask>,
    /// Distinct quasi-identifier categories needed before quasi rules apply
    #[serde(default = "default_combination_threshold")]
    pub combination_threshold: usize,
    /// Salt mixed into hash previews
    #[serde(default)]
    pub hash_salt: String,
}

fn default_combination_threshold() -> usize {
    2
}

/// One detection rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Unique identifier within the bundle
    pub id: String,
    /// Category name (see [`Category`])
    pub category: String,
    /// What to look for
    pub pattern: PatternDef,
    /// Field selectors this rule applies to
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    /// Rewrite applied to matches
    #[serde(default)]
    pub action: RedactionAction,
    /// Severity used for overlap resolution and evaluation order
    #[serde(default)]
    pub severity: Severity,
    /// Still evaluated in critical-only mode
    #[serde(default)]
    pub critical: bool,
    /// Optional checksum validator name (`luhn`, `ssn`, `iban`, `verhoeff`)
    #[serde(default)]
    pub validator: Option<String>,
    /// Only applied when enough quasi-identifiers co-occur in the document
    #[serde(default)]
    pub quasi: bool,
    /// Detections are offered to the false-positive review sample
    #[serde(default)]
    pub review: bool,
}

fn default_fields() -> Vec<String> {
    vec!["*".to_string()]
}

impl RuleSpec {
    /// Regex rule applying to any string value
    pub fn regex(id: &str, category: Category, pattern: &str) -> Self {
        Self {
            id: id.to_string(),
            category: category.as_str().to_string(),
            pattern: PatternDef::Regex(pattern.to_string()),
            fields: default_fields(),
            action: RedactionAction::RedactFull,
            severity: Severity::default(),
            critical: false,
            validator: None,
            quasi: false,
            review: false,
        }
    }

    /// Restrict to the given field selectors
    pub fn on_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Mark as critical
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Set action
    pub fn with_action(mut self, action: RedactionAction) -> Self {
        self.action = action;
        self
    }

    /// Set severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set checksum validator
    pub fn with_validator(mut self, validator: &str) -> Self {
        self.validator = Some(validator.to_string());
        self
    }

    /// Mark as quasi-identifier
    pub fn quasi(mut self) -> Self {
        self.quasi = true;
        self
    }
}

/// Pattern definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PatternDef {
    /// Regular expression (Rust `regex` syntax)
    Regex(String),
    /// Literal strings, matched ASCII case-insensitively
    Literal(Vec<String>),
}

impl PatternDef {
    /// True when nothing would ever be matched
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Regex(pattern) => pattern.trim().is_empty(),
            Self::Literal(values) => values.iter().all(|v| v.is_empty()),
        }
    }
}

/// Partial mask layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskStyle {
    /// Keep `keep_prefix` leading and `keep_suffix` trailing characters
    Edges,
    /// Keep the first characters of the local part and the whole domain
    Email,
    /// Keep the first letter of every word
    Initials,
    /// Keep the first and last IPv4 octets
    Ipv4,
    /// Keep a short prefix and any trailing postal code
    Address,
}

/// Per-category partial redaction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialMask {
    /// Layout
    #[serde(default = "default_style")]
    pub style: MaskStyle,
    /// Characters preserved at the start
    #[serde(default)]
    pub keep_prefix: usize,
    /// Characters preserved at the end
    #[serde(default)]
    pub keep_suffix: usize,
    /// Replacement character
    #[serde(default = "default_mask_char")]
    pub mask_char: char,
}

fn default_style() -> MaskStyle {
    MaskStyle::Edges
}

fn default_mask_char() -> char {
    'X'
}

impl PartialMask {
    const fn edges(keep_prefix: usize, keep_suffix: usize) -> Self {
        Self {
            style: MaskStyle::Edges,
            keep_prefix,
            keep_suffix,
            mask_char: 'X',
        }
    }

    const fn styled(style: MaskStyle, keep_prefix: usize) -> Self {
        Self {
            style,
            keep_prefix,
            keep_suffix: 0,
            mask_char: 'X',
        }
    }

    /// Built-in mask for a category
    pub fn default_for(category: Category) -> Self {
        match category {
            Category::Phone => Self::edges(2, 2),
            Category::NationalId => Self::edges(4, 4),
            Category::Passport => Self::edges(1, 0),
            Category::Payment => Self::edges(0, 4),
            Category::DeviceId => Self::edges(3, 3),
            Category::Email | Category::Upi => Self::styled(MaskStyle::Email, 2),
            Category::Name => Self::styled(MaskStyle::Initials, 1),
            Category::IpAddress => Self::styled(MaskStyle::Ipv4, 0),
            Category::Address => Self::styled(MaskStyle::Address, 3),
            Category::DateOfBirth => Self::edges(0, 4),
        }
    }
}
