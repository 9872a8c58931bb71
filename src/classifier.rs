// 🏷️ Classification Rules - `field: pattern` rules evaluated in memory
// Rule file: {"rule text": ["tag", ...], ...} in definition order

use crate::db::{self, Transaction, TRANSACTION_FIELDS};
use crate::error::{Error, Result};
use crate::filter::CompareOp;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// RULE COMPONENTS
// ============================================================================

/// How a single pattern is tested against a field
#[derive(Debug, Clone)]
pub enum Matcher {
    /// `!pattern`
    CaseSensitive(Regex),
    /// `<>pattern`, case-insensitive
    NotMatching(Regex),
    /// `>50`, `<=10.5`, ...
    Compare(CompareOp, f64),
    /// anything else, case-insensitive
    Matching(Regex),
}

impl Matcher {
    fn parse(field: &str, pattern: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidPattern {
            field: field.to_string(),
            pattern: pattern.to_string(),
            reason,
        };
        let regex = |source: &str, insensitive: bool| {
            RegexBuilder::new(source)
                .case_insensitive(insensitive)
                .build()
                .map_err(|e| invalid(e.to_string()))
        };

        if let Some(rest) = pattern.strip_prefix('!') {
            return Ok(Matcher::CaseSensitive(regex(rest, false)?));
        }
        if let Some(rest) = pattern.strip_prefix("<>") {
            return Ok(Matcher::NotMatching(regex(rest, true)?));
        }

        // longest operator first
        let comparisons = [
            (">=", CompareOp::Gte),
            ("<=", CompareOp::Lte),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
        ];
        for (prefix, op) in comparisons {
            if let Some(rest) = pattern.strip_prefix(prefix) {
                let value: f64 = rest
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("expected a number after '{}'", prefix)))?;
                return Ok(Matcher::Compare(op, value));
            }
        }

        Ok(Matcher::Matching(regex(pattern, true)?))
    }
}

/// One `field: pattern` constraint. Equality is on `(field, pattern)`.
#[derive(Debug, Clone)]
pub struct RuleComponent {
    pub field: String,
    pub pattern: String,
    matcher: Matcher,
}

impl PartialEq for RuleComponent {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.pattern == other.pattern
    }
}

impl Eq for RuleComponent {}

impl RuleComponent {
    pub fn new(field: &str, pattern: &str) -> Result<Self> {
        Ok(RuleComponent {
            field: field.to_string(),
            pattern: pattern.to_string(),
            matcher: Matcher::parse(field, pattern)?,
        })
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Missing fields read as empty text and never satisfy a numeric test
    pub fn matches(&self, tx: &Transaction) -> bool {
        let value = tx.field(&self.field);
        let text = value
            .as_ref()
            .map(|v| v.as_text().into_owned())
            .unwrap_or_default();

        match &self.matcher {
            Matcher::CaseSensitive(re) | Matcher::Matching(re) => re.is_match(&text),
            Matcher::NotMatching(re) => !re.is_match(&text),
            Matcher::Compare(op, expected) => value
                .and_then(|v| v.as_number())
                .is_some_and(|actual| op.holds(actual, *expected)),
        }
    }
}

impl fmt::Display for RuleComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.pattern)
    }
}

/// Split rule text on `;` / newlines, then each segment at its first `:`
pub fn parse_rule(text: &str) -> Result<Vec<RuleComponent>> {
    text.split(|c| c == ';' || c == '\n')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let (field, pattern) =
                segment
                    .split_once(':')
                    .ok_or_else(|| Error::MalformedRule {
                        segment: segment.to_string(),
                    })?;
            let field = field.trim();
            if !TRANSACTION_FIELDS.contains(&field) {
                return Err(Error::UnknownField {
                    field: field.to_string(),
                    rule: text.to_string(),
                });
            }
            RuleComponent::new(field, pattern.trim())
        })
        .collect()
}

/// All components must match
pub fn check_transaction(tx: &Transaction, components: &[RuleComponent]) -> bool {
    components.iter().all(|component| component.matches(tx))
}

// ============================================================================
// PATTERN CACHE
// ============================================================================

/// Parsed components memoized by exact rule text
#[derive(Debug, Default)]
pub struct PatternCache {
    entries: HashMap<String, Arc<Vec<RuleComponent>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, text: &str) -> Result<Arc<Vec<RuleComponent>>> {
        if let Some(components) = self.entries.get(text) {
            return Ok(Arc::clone(components));
        }
        let components = Arc::new(parse_rule(text)?);
        self.entries.insert(text.to_string(), Arc::clone(&components));
        Ok(components)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub text: String,
    pub tags: Vec<String>,
    pub components: Arc<Vec<RuleComponent>>,
}

/// Immutable snapshot of the classifier rules
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: String,
    loaded_at: DateTime<Utc>,
    rules: Vec<ClassifierRule>,
}

impl RuleSet {
    /// Parse `{"rule text": ["tag", ...]}`; every rule is compiled up front
    pub fn from_json(source: &str, cache: &mut PatternCache) -> Result<Self> {
        let entries: serde_json::Map<String, Value> = serde_json::from_str(source)?;

        let mut rules = Vec::with_capacity(entries.len());
        for (text, tags) in entries {
            let tags: Vec<String> = serde_json::from_value(tags)?;
            let components = cache.parse(&text)?;
            rules.push(ClassifierRule {
                text,
                tags,
                components,
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());

        Ok(RuleSet {
            version: format!("{:x}", hasher.finalize()),
            loaded_at: Utc::now(),
            rules,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Where classifier rules come from
#[derive(Debug, Clone, PartialEq)]
pub enum RuleSource {
    File(PathBuf),
    Inline(String),
}

impl RuleSource {
    pub fn load(&self) -> Result<RuleSet> {
        self.load_with(&mut PatternCache::new())
    }

    pub fn load_with(&self, cache: &mut PatternCache) -> Result<RuleSet> {
        let source = match self {
            RuleSource::File(path) => fs::read_to_string(path)?,
            RuleSource::Inline(text) => text.clone(),
        };
        let rules = RuleSet::from_json(&source, cache)?;

        info!(rules = rules.len(), version = %&rules.version[..12], "classifier rules loaded");
        Ok(rules)
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifyReport {
    pub version: String,
    pub loaded_at: DateTime<Utc>,
    pub rules: usize,
    pub transactions: usize,
    pub tagged: usize,
}

/// Tags of every matching rule, in definition order (duplicates kept)
pub fn classify(tx: &Transaction, rules: &RuleSet) -> Vec<String> {
    rules
        .rules
        .iter()
        .filter(|rule| check_transaction(tx, &rule.components))
        .flat_map(|rule| rule.tags.iter().cloned())
        .collect()
}

fn dedup_preserving_order(tags: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if !unique.contains(&tag) {
            unique.push(tag);
        }
    }
    unique
}

/// Classify one stored transaction; tags are saved only when some rule matched
pub fn classify_id(conn: &Connection, rules: &RuleSet, id: &str) -> Result<Vec<String>> {
    let tx = db::get_transaction(conn, id)?
        .ok_or_else(|| Error::TransactionNotFound(id.to_string()))?;

    let tags = dedup_preserving_order(classify(&tx, rules));
    if !tags.is_empty() {
        db::save_tags(conn, id, &tags)?;
    }
    debug!(id, tags = ?tags, "transaction classified");
    Ok(tags)
}

pub fn classify_all_transactions(conn: &Connection, rules: &RuleSet) -> Result<ClassifyReport> {
    let ids = db::all_transaction_ids(conn)?;

    let tx = conn.unchecked_transaction()?;
    let mut tagged = 0;
    for id in &ids {
        if !classify_id(&tx, rules, id)?.is_empty() {
            tagged += 1;
        }
    }
    tx.commit()?;

    let report = ClassifyReport {
        version: rules.version.clone(),
        loaded_at: rules.loaded_at,
        rules: rules.len(),
        transactions: ids.len(),
        tagged,
    };
    info!(transactions = report.transactions, tagged, "reclassification finished");
    Ok(report)
}

/// Load a fresh snapshot from `source`, then reclassify everything with it
pub fn reload_and_reclassify(conn: &Connection, source: &RuleSource) -> Result<ClassifyReport> {
    let rules = source.load()?;
    classify_all_transactions(conn, &rules)
}

// ============================================================================
// TESTS
// ============================================================================
