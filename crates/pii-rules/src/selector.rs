//! Field selectors and the per-ruleset selector index
//!
//! The index answers "which rules may fire on this field?" with a hash lookup
//! plus a short glob list, so fields without applicable rules never reach a
//! pattern matcher.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;

/// Selector over JSON field names
#[derive(Debug, Clone)]
pub enum FieldSelector {
    /// Any string value, including values without a field name
    Any,
    /// Exact, case-insensitive field name
    Exact(String),
    /// Glob over the field name (`*` and `?`)
    Glob {
        /// Selector as written
        source: String,
        /// Anchored, case-insensitive translation
        regex: Regex,
    },
}

impl FieldSelector {
    /// Parse a selector string
    pub fn parse(raw: &str) -> Result<Self, String> {
        let selector = raw.trim();
        if selector.is_empty() {
            return Err("empty selector".to_string());
        }
        if selector == "*" {
            return Ok(Self::Any);
        }
        if let Some(c) = selector
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || *c == '[' || *c == ']')
        {
            return Err(format!("unsupported character {c:?}"));
        }

        if !selector.contains(|c| c == '*' || c == '?') {
            return Ok(Self::Exact(selector.to_ascii_lowercase()));
        }

        let mut pattern = String::with_capacity(selector.len() + 8);
        pattern.push('^');
        for c in selector.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        pattern.push('$');

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| e.to_string())?;

        Ok(Self::Glob {
            source: selector.to_ascii_lowercase(),
            regex,
        })
    }

    /// Canonical text, used to detect allow/deny conflicts
    pub fn canonical(&self) -> &str {
        match self {
            Self::Any => "*",
            Self::Exact(name) => name,
            Self::Glob { source, .. } => source,
        }
    }

    /// Check a field name (`None` for values outside any object)
    pub fn matches(&self, field: Option<&str>) -> bool {
        match (self, field) {
            (Self::Any, _) => true,
            (Self::Exact(name), Some(field)) => name.eq_ignore_ascii_case(field),
            (Self::Glob { regex, .. }, Some(field)) => regex.is_match(field),
            (_, None) => false,
        }
    }
}

/// Bundle-level allow/deny policy
#[derive(Debug, Clone, Default)]
pub struct FieldPolicy {
    deny: Vec<FieldSelector>,
    allow: Vec<FieldSelector>,
}

impl FieldPolicy {
    /// Build from parsed selectors
    pub fn new(deny: Vec<FieldSelector>, allow: Vec<FieldSelector>) -> Self {
        Self { deny, allow }
    }

    /// Whether a field is eligible for scanning at all
    #[inline]
    pub fn is_scannable(&self, field: Option<&str>) -> bool {
        if self.deny.iter().any(|s| s.matches(field)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|s| s.matches(field))
    }

    /// Number of deny entries
    pub fn deny_count(&self) -> usize {
        self.deny.len()
    }

    /// Number of allow entries
    pub fn allow_count(&self) -> usize {
        self.allow.len()
    }
}

/// Maps field names to the rules that may apply
#[derive(Debug, Default)]
pub struct SelectorIndex {
    exact: HashMap<String, Vec<usize>>,
    globs: Vec<(Regex, Vec<usize>)>,
    any: Vec<usize>,
}

impl SelectorIndex {
    /// Register a rule under a selector
    pub(crate) fn insert(&mut self, selector: &FieldSelector, rule: usize) {
        match selector {
            FieldSelector::Any => self.any.push(rule),
            FieldSelector::Exact(name) => self.exact.entry(name.clone()).or_default().push(rule),
            FieldSelector::Glob { regex, .. } => {
                match self.globs.iter_mut().find(|(r, _)| r.as_str() == regex.as_str()) {
                    Some((_, rules)) => rules.push(rule),
                    None => self.globs.push((regex.clone(), vec![rule])),
                }
            }
        }
    }

    /// Mark applicable rules for a field in `out` (indexed by rule).
    /// Returns true when at least one rule applies.
    pub fn applicable(&self, field: Option<&str>, out: &mut [bool]) -> bool {
        out.iter_mut().for_each(|slot| *slot = false);
        let mut any = false;

        for &rule in &self.any {
            out[rule] = true;
            any = true;
        }

        if let Some(field) = field {
            let hit = if field.bytes().any(|b| b.is_ascii_uppercase()) {
                self.exact.get(&field.to_ascii_lowercase())
            } else {
                self.exact.get(field)
            };
            if let Some(rules) = hit {
                for &rule in rules {
                    out[rule] = true;
                    any = true;
                }
            }

            for (regex, rules) in &self.globs {
                if regex.is_match(field) {
                    for &rule in rules {
                        out[rule] = true;
                        any = true;
                    }
                }
            }
        }

        any
    }
}
