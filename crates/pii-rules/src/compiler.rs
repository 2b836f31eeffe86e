//! Rule compiler: validates a bundle and builds the request-time matcher set

use crate::bundle::{PartialMask, PatternDef, RuleBundle, RuleSpec};
use crate::checksum::Validator;
use crate::selector::{FieldPolicy, FieldSelector, SelectorIndex};
use crate::{Category, RedactionAction, Severity};
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Compiled regex size ceiling per pattern (bounds worst-case memory)
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Why a bundle was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileErrorKind {
    /// Rule id missing
    #[error("empty rule id")]
    EmptyRuleId,
    /// Two rules share an id
    #[error("duplicate rule id")]
    DuplicateRuleId,
    /// Pattern has no content
    #[error("empty pattern")]
    EmptyPattern,
    /// Regex failed to parse or exceeded limits
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// Category name not recognized
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    /// Validator name not recognized
    #[error("unknown validator `{0}`")]
    UnknownValidator(String),
    /// Field selector failed to parse
    #[error("invalid field selector `{selector}`: {message}")]
    InvalidSelector {
        /// Selector as written
        selector: String,
        /// Parser message
        message: String,
    },
    /// Same selector present in allow and deny lists
    #[error("field selector `{0}` is both allowed and denied")]
    ConflictingFieldPolicy(String),
    /// Mask configuration is unusable
    #[error("invalid mask: {0}")]
    InvalidMask(String),
}

/// Bundle compilation failure; the previously active ruleset stays in place
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bundle rejected: {reason} (rule: {})", .rule_id.as_deref().unwrap_or("-"))]
pub struct CompileError {
    /// What went wrong
    pub reason: CompileErrorKind,
    /// Offending rule, when the failure is rule-specific
    pub rule_id: Option<String>,
}

impl CompileError {
    fn bundle(reason: CompileErrorKind) -> Self {
        Self { reason, rule_id: None }
    }

    fn rule(reason: CompileErrorKind, rule: &RuleSpec) -> Self {
        Self {
            reason,
            rule_id: Some(rule.id.clone()),
        }
    }
}

/// Operator-side compile toggles
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Categories whose rules are excluded from compilation
    pub disabled_categories: HashSet<Category>,
}

impl CompileOptions {
    /// Build from a category → enabled map (missing entries stay enabled)
    pub fn from_toggles(toggles: &HashMap<Category, bool>) -> Self {
        Self {
            disabled_categories: toggles
                .iter()
                .filter(|(_, enabled)| !**enabled)
                .map(|(category, _)| *category)
                .collect(),
        }
    }
}

/// Executable form of one rule
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Rule id from the bundle
    pub id: String,
    /// Category
    pub category: Category,
    /// Rewrite applied to matches
    pub action: RedactionAction,
    /// Severity
    pub severity: Severity,
    /// Evaluated in critical-only mode
    pub critical: bool,
    /// Applied only when enough quasi-identifiers co-occur
    pub quasi: bool,
    /// Sampled for false-positive review
    pub review: bool,
    /// Rule applies to any string value
    pub broad: bool,
    /// Post-match validator
    pub validator: Option<Validator>,
}

/// A raw match produced by a category matcher (byte offsets into the value)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMatch {
    /// Index into [`CompiledRuleset::rules`]
    pub rule: usize,
    /// Start byte offset
    pub start: usize,
    /// End byte offset (exclusive)
    pub end: usize,
}

/// Patterns of one category combined into shared automata
#[derive(Debug)]
struct PatternGroup {
    /// One pass over the text tells which regexes fire
    set: Option<RegexSet>,
    regexes: Vec<Regex>,
    regex_rules: Vec<usize>,
    /// Literal alternatives for every literal rule
    literals: Option<AhoCorasick>,
    literal_rules: Vec<usize>,
}

impl PatternGroup {
    fn build(
        rules: &[(usize, &RuleSpec)],
        regexes: &HashMap<usize, Regex>,
    ) -> Result<Option<Self>, CompileError> {
        if rules.is_empty() {
            return Ok(None);
        }

        let mut regex_sources = Vec::new();
        let mut compiled = Vec::new();
        let mut regex_rules = Vec::new();
        let mut literal_values = Vec::new();
        let mut literal_rules = Vec::new();

        for &(idx, spec) in rules {
            match &spec.pattern {
                PatternDef::Regex(_) => {
                    if let Some(re) = regexes.get(&idx) {
                        regex_sources.push(re.as_str().to_string());
                        compiled.push(re.clone());
                        regex_rules.push(idx);
                    }
                }
                PatternDef::Literal(values) => {
                    for value in values.iter().filter(|v| !v.is_empty()) {
                        literal_values.push(value.clone());
                        literal_rules.push(idx);
                    }
                }
            }
        }

        let set = if regex_sources.is_empty() {
            None
        } else {
            let set = RegexSetBuilder::new(&regex_sources)
                .size_limit(REGEX_SIZE_LIMIT * regex_sources.len())
                .build()
                .map_err(|e| {
                    CompileError::bundle(CompileErrorKind::InvalidPattern(e.to_string()))
                })?;
            Some(set)
        };

        let literals = if literal_values.is_empty() {
            None
        } else {
            let ac = AhoCorasickBuilder::new()
                .match_kind(MatchKind::LeftmostLongest)
                .ascii_case_insensitive(true)
                .build(&literal_values)
                .map_err(|e| {
                    CompileError::bundle(CompileErrorKind::InvalidPattern(e.to_string()))
                })?;
            Some(ac)
        };

        Ok(Some(Self {
            set,
            regexes: compiled,
            regex_rules,
            literals,
            literal_rules,
        }))
    }

    /// Append matches to `out` until it holds `limit` entries. Returns false
    /// when matches were dropped at the limit.
    fn find(
        &self,
        text: &str,
        rules: &[CompiledRule],
        applicable: &[bool],
        limit: usize,
        out: &mut Vec<RawMatch>,
    ) -> bool {
        if let Some(set) = &self.set {
            for pattern in set.matches(text).into_iter() {
                let rule = self.regex_rules[pattern];
                if !applicable[rule] {
                    continue;
                }
                for m in self.regexes[pattern].find_iter(text) {
                    if m.start() == m.end() {
                        continue;
                    }
                    if let Some(validator) = rules[rule].validator {
                        if !validator.validate(m.as_str()) {
                            continue;
                        }
                    }
                    if out.len() >= limit {
                        return false;
                    }
                    out.push(RawMatch { rule, start: m.start(), end: m.end() });
                }
            }
        }

        if let Some(literals) = &self.literals {
            for m in literals.find_iter(text) {
                let rule = self.literal_rules[m.pattern().as_usize()];
                if !applicable[rule] {
                    continue;
                }
                if let Some(validator) = rules[rule].validator {
                    if !validator.validate(&text[m.start()..m.end()]) {
                        continue;
                    }
                }
                if out.len() >= limit {
                    return false;
                }
                out.push(RawMatch { rule, start: m.start(), end: m.end() });
            }
        }
        true
    }
}

/// All matchers for one category
#[derive(Debug)]
pub struct CategoryMatcher {
    category: Category,
    max_severity: Severity,
    rules: Vec<usize>,
    all: PatternGroup,
    critical: Option<PatternGroup>,
}

impl CategoryMatcher {
    /// Category handled by this matcher
    pub fn category(&self) -> Category {
        self.category
    }

    /// Highest severity among its rules
    pub fn max_severity(&self) -> Severity {
        self.max_severity
    }

    /// Whether any of this category's rules is marked applicable
    #[inline]
    pub fn is_applicable(
        &self,
        applicable: &[bool],
        critical_only: bool,
        rules: &[CompiledRule],
    ) -> bool {
        if critical_only && self.critical.is_none() {
            return false;
        }
        self.rules
            .iter()
            .any(|&r| applicable[r] && (!critical_only || rules[r].critical))
    }

    /// Whether the category has critical rules
    pub fn has_critical(&self) -> bool {
        self.critical.is_some()
    }
}

/// Executable, immutable form of a [`RuleBundle`]
#[derive(Debug)]
pub struct CompiledRuleset {
    version: u64,
    signature_ref: Option<String>,
    compiled_at: DateTime<Utc>,
    rules: Vec<CompiledRule>,
    /// Sorted by descending max severity
    matchers: Vec<CategoryMatcher>,
    index: SelectorIndex,
    policy: FieldPolicy,
    masks: HashMap<Category, PartialMask>,
    combination_threshold: usize,
    hash_salt: String,
    disabled: Vec<Category>,
}

impl CompiledRuleset {
    /// Bundle version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Issuer signature reference
    pub fn signature_ref(&self) -> Option<&str> {
        self.signature_ref.as_deref()
    }

    /// When compilation finished
    pub fn compiled_at(&self) -> DateTime<Utc> {
        self.compiled_at
    }

    /// Compiled rules in bundle order
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Rule by index
    #[inline]
    pub fn rule(&self, idx: usize) -> &CompiledRule {
        &self.rules[idx]
    }

    /// Category matchers, highest severity first
    pub fn matchers(&self) -> &[CategoryMatcher] {
        &self.matchers
    }

    /// Allow/deny policy
    pub fn policy(&self) -> &FieldPolicy {
        &self.policy
    }

    /// Mark applicable rules for a field; false means no matcher needs to run
    #[inline]
    pub fn applicable_rules(&self, field: Option<&str>, out: &mut [bool]) -> bool {
        self.index.applicable(field, out)
    }

    /// Run one category matcher over a value, keeping at most `limit`
    /// matches in `out`. Returns false when the limit cut matching short.
    pub fn find_matches(
        &self,
        matcher: &CategoryMatcher,
        text: &str,
        applicable: &[bool],
        critical_only: bool,
        limit: usize,
        out: &mut Vec<RawMatch>,
    ) -> bool {
        let group = if critical_only {
            match &matcher.critical {
                Some(group) => group,
                None => return true,
            }
        } else {
            &matcher.all
        };
        group.find(text, &self.rules, applicable, limit, out)
    }

    /// Partial mask for a category
    pub fn mask_for(&self, category: Category) -> PartialMask {
        self.masks
            .get(&category)
            .copied()
            .unwrap_or_else(|| PartialMask::default_for(category))
    }

    /// Distinct quasi categories required before quasi rules apply
    pub fn combination_threshold(&self) -> usize {
        self.combination_threshold
    }

    /// Salt for hash previews
    pub fn hash_salt(&self) -> &str {
        &self.hash_salt
    }

    /// Categories excluded by operator toggles
    pub fn disabled_categories(&self) -> &[Category] {
        &self.disabled
    }

    /// Number of critical rules
    pub fn critical_count(&self) -> usize {
        self.rules.iter().filter(|r| r.critical).count()
    }
}

/// Compile with default options (every category enabled)
pub fn compile(bundle: &RuleBundle) -> Result<CompiledRuleset, CompileError> {
    compile_with(bundle, &CompileOptions::default())
}

/// Validate and compile a bundle
pub fn compile_with(
    bundle: &RuleBundle,
    options: &CompileOptions,
) -> Result<CompiledRuleset, CompileError> {
    let policy = compile_policy(bundle)?;
    let masks = compile_masks(bundle)?;

    let mut seen = HashSet::new();
    let mut rules = Vec::new();
    let mut specs: Vec<&RuleSpec> = Vec::new();
    let mut regexes = HashMap::new();
    let mut index = SelectorIndex::default();

    for spec in &bundle.rules {
        if spec.id.trim().is_empty() {
            return Err(CompileError::rule(CompileErrorKind::EmptyRuleId, spec));
        }
        if !seen.insert(spec.id.as_str()) {
            return Err(CompileError::rule(CompileErrorKind::DuplicateRuleId, spec));
        }

        let category: Category = spec
            .category
            .parse()
            .map_err(|c| CompileError::rule(CompileErrorKind::UnknownCategory(c), spec))?;

        if spec.pattern.is_empty() {
            return Err(CompileError::rule(CompileErrorKind::EmptyPattern, spec));
        }

        // Validate before honoring toggles so a disabled rule cannot hide a broken bundle.
        let regex = match &spec.pattern {
            PatternDef::Regex(source) => Some(
                RegexBuilder::new(source)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| {
                        CompileError::rule(CompileErrorKind::InvalidPattern(e.to_string()), spec)
                    })?,
            ),
            PatternDef::Literal(_) => None,
        };

        let validator = spec
            .validator
            .as_deref()
            .map(|v| v.parse::<Validator>())
            .transpose()
            .map_err(|v| CompileError::rule(CompileErrorKind::UnknownValidator(v), spec))?;

        if spec.fields.is_empty() {
            return Err(CompileError::rule(
                CompileErrorKind::InvalidSelector {
                    selector: String::new(),
                    message: "rule has no field selector".to_string(),
                },
                spec,
            ));
        }
        let selectors = spec
            .fields
            .iter()
            .map(|raw| {
                FieldSelector::parse(raw).map_err(|message| {
                    CompileError::rule(
                        CompileErrorKind::InvalidSelector { selector: raw.clone(), message },
                        spec,
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if options.disabled_categories.contains(&category) {
            tracing::debug!(rule = %spec.id, %category, "rule excluded by category toggle");
            continue;
        }

        let idx = rules.len();
        for selector in &selectors {
            index.insert(selector, idx);
        }
        if let Some(regex) = regex {
            regexes.insert(idx, regex);
        }

        rules.push(CompiledRule {
            id: spec.id.clone(),
            category,
            action: spec.action,
            severity: spec.severity,
            critical: spec.critical,
            quasi: spec.quasi,
            review: spec.review,
            broad: selectors.iter().any(|s| matches!(s, FieldSelector::Any)),
            validator,
        });
        specs.push(spec);
    }

    let matchers = build_matchers(&rules, &specs, &regexes)?;

    let mut disabled: Vec<Category> = options.disabled_categories.iter().copied().collect();
    disabled.sort();

    tracing::debug!(
        version = bundle.version,
        rules = rules.len(),
        categories = matchers.len(),
        "compiled rule bundle"
    );

    Ok(CompiledRuleset {
        version: bundle.version,
        signature_ref: bundle.signature_ref.clone(),
        compiled_at: Utc::now(),
        rules,
        matchers,
        index,
        policy,
        masks,
        combination_threshold: bundle.combination_threshold.max(1),
        hash_salt: bundle.hash_salt.clone(),
        disabled,
    })
}

fn compile_policy(bundle: &RuleBundle) -> Result<FieldPolicy, CompileError> {
    let parse_all = |raw: &[String]| {
        raw.iter()
            .map(|s| {
                FieldSelector::parse(s).map_err(|message| {
                    CompileError::bundle(CompileErrorKind::InvalidSelector {
                        selector: s.clone(),
                        message,
                    })
                })
            })
            .collect::<Result<Vec<_>, _>>()
    };

    let deny = parse_all(&bundle.deny_fields)?;
    let allow = parse_all(&bundle.allow_fields)?;

    let denied: HashSet<&str> = deny.iter().map(|s| s.canonical()).collect();
    if let Some(conflict) = allow.iter().find(|s| denied.contains(s.canonical())) {
        return Err(CompileError::bundle(CompileErrorKind::ConflictingFieldPolicy(
            conflict.canonical().to_string(),
        )));
    }

    Ok(FieldPolicy::new(deny, allow))
}

fn compile_masks(bundle: &RuleBundle) -> Result<HashMap<Category, PartialMask>, CompileError> {
    let mut masks = HashMap::new();
    for (name, mask) in &bundle.masks {
        let category: Category = name
            .parse()
            .map_err(|c| CompileError::bundle(CompileErrorKind::UnknownCategory(c)))?;
        if mask.mask_char.is_alphanumeric() && mask.mask_char != 'X' && mask.mask_char != 'x' {
            return Err(CompileError::bundle(CompileErrorKind::InvalidMask(format!(
                "mask character {:?} for {category} could be mistaken for data",
                mask.mask_char
            ))));
        }
        masks.insert(category, *mask);
    }
    Ok(masks)
}

fn build_matchers(
    rules: &[CompiledRule],
    specs: &[&RuleSpec],
    regexes: &HashMap<usize, Regex>,
) -> Result<Vec<CategoryMatcher>, CompileError> {
    let mut by_category: HashMap<Category, Vec<usize>> = HashMap::new();
    for (idx, rule) in rules.iter().enumerate() {
        by_category.entry(rule.category).or_default().push(idx);
    }

    let mut matchers = Vec::with_capacity(by_category.len());
    for (category, members) in by_category {
        let all: Vec<(usize, &RuleSpec)> = members.iter().map(|&i| (i, specs[i])).collect();
        let critical: Vec<(usize, &RuleSpec)> =
            all.iter().copied().filter(|(i, _)| rules[*i].critical).collect();

        let Some(all_group) = PatternGroup::build(&all, regexes)? else {
            continue;
        };
        let critical_group = PatternGroup::build(&critical, regexes)?;

        let max_severity = members
            .iter()
            .map(|&i| rules[i].severity)
            .max()
            .unwrap_or_default();

        matchers.push(CategoryMatcher {
            category,
            max_severity,
            rules: members,
            all: all_group,
            critical: critical_group,
        });
    }

    matchers.sort_by(|a, b| {
        b.max_severity
            .cmp(&a.max_severity)
            .then_with(|| a.category.cmp(&b.category))
    });

    Ok(matchers)
}
