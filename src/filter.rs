// 🔎 Structured Filter Compiler - {field: {operator: value}} → WHERE fragments
//
// Logical fields expand to one or more physical columns. Operator templates use
// `%%` for the column reference; only allowlisted column names are substituted,
// user values always travel as bound parameters.

use crate::error::{Error, Result};
use crate::predicate::SqlParam;
use crate::rule_sql::with_inline_flags;
use regex::Regex;
use serde_json::Value;
use std::fmt;

// ============================================================================
// FIELDS
// ============================================================================

/// Filter keys accepted by the query API
pub const FILTER_FIELDS: [&str; 14] = [
    "all",
    "description",
    "revised_description",
    "new_description",
    "tags",
    "manual_tags",
    "auto_tags",
    "type",
    "debit",
    "credit",
    "amount",
    "balance",
    "account",
    "datetime",
];

pub fn validate_filter_field(field: &str) -> Result<&'static str> {
    FILTER_FIELDS
        .iter()
        .find(|allowed| allowed.eq_ignore_ascii_case(field))
        .copied()
        .ok_or_else(|| Error::InvalidField(field.to_string()))
}

/// Physical columns behind a logical filter field
pub fn physical_columns(field: &'static str) -> Vec<&'static str> {
    match field {
        "description" => vec!["description", "revised_description"],
        "new_description" => vec!["revised_description"],
        "tags" => vec!["auto_tags", "manual_tags"],
        "all" => vec![
            "description",
            "revised_description",
            "tags",
            "manual_tags",
            "type",
            "party",
        ],
        other => vec![other],
    }
}

/// Tag columns hold JSON arrays and get membership predicates for `in`
fn is_tag_field(field: &str) -> bool {
    field.contains("tags")
}

// ============================================================================
// OPERATORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gte,
    Gt,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Gte => ">=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Eq => "=",
            CompareOp::Neq => "<>",
        }
    }

    /// Evaluate `left op right` in memory
    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Gte => left >= right,
            CompareOp::Gt => left > right,
            CompareOp::Lt => left < right,
            CompareOp::Lte => left <= right,
            CompareOp::Eq => left == right,
            CompareOp::Neq => left != right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Compare(CompareOp),
    StartsWith,
    EndsWith,
    Contains,
    Regex,
    In,
    Empty,
}

/// Operator with its `abs` / `not_` modifiers stripped off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorDefinition {
    pub kind: OperatorKind,
    pub abs: bool,
    pub not: bool,
}

impl OperatorDefinition {
    /// Parse `abs>`, `not_contains`, `startsWith`, ...
    pub fn parse(operator: &str) -> Result<Self> {
        let mut rest = operator.trim();
        let mut abs = false;
        let mut not = false;

        if let Some(stripped) = rest.strip_prefix("abs") {
            abs = true;
            rest = stripped.trim_start();
        }
        if let Some(stripped) = rest.strip_prefix("not_") {
            not = true;
            rest = stripped;
        }

        let kind = match rest.to_lowercase().as_str() {
            ">=" => OperatorKind::Compare(CompareOp::Gte),
            ">" => OperatorKind::Compare(CompareOp::Gt),
            "<" => OperatorKind::Compare(CompareOp::Lt),
            "<=" => OperatorKind::Compare(CompareOp::Lte),
            "=" => OperatorKind::Compare(CompareOp::Eq),
            "<>" => OperatorKind::Compare(CompareOp::Neq),
            "startswith" => OperatorKind::StartsWith,
            "endswith" => OperatorKind::EndsWith,
            "contains" => OperatorKind::Contains,
            "regex" => OperatorKind::Regex,
            "in" => OperatorKind::In,
            "empty" => OperatorKind::Empty,
            _ => return Err(Error::InvalidOperator(operator.to_string())),
        };

        Ok(OperatorDefinition { kind, abs, not })
    }

    pub fn id(&self) -> &'static str {
        match self.kind {
            OperatorKind::Compare(op) => op.as_sql(),
            OperatorKind::StartsWith => "startsWith",
            OperatorKind::EndsWith => "endsWith",
            OperatorKind::Contains => "contains",
            OperatorKind::Regex => "regex",
            OperatorKind::In => "in",
            OperatorKind::Empty => "empty",
        }
    }
}

impl fmt::Display for OperatorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.abs {
            f.write_str("abs")?;
        }
        if self.not {
            f.write_str("not_")?;
        }
        f.write_str(self.id())
    }
}

// ============================================================================
// VALUES
// ============================================================================

/// `coffee`, `/coffee/i` or `coffee/i`: a trailing `/flags` turns into inline
/// flags, a leading `/` is dropped. The pattern is checked here so a bad one
/// never reaches REGEXP.
fn regex_value(value: &str, op: &OperatorDefinition) -> Result<String> {
    let (pattern, flags) = match value.rfind('/') {
        Some(idx) if value[idx + 1..].chars().all(|c| c.is_ascii_lowercase()) => {
            (&value[..idx], &value[idx + 1..])
        }
        _ => (value, ""),
    };
    let pattern = pattern.strip_prefix('/').unwrap_or(pattern);
    let pattern = with_inline_flags(pattern, flags);

    Regex::new(&pattern).map_err(|e| Error::InvalidValue {
        operator: op.to_string(),
        reason: e.to_string(),
    })?;
    Ok(pattern)
}

/// Matches `^[+-]?\d*\.?\d+$`
fn is_numeric(value: &str) -> bool {
    let digits = value.strip_prefix(['+', '-']).unwrap_or(value);
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    match digits.split_once('.') {
        Some((int, frac)) => !frac.is_empty() && all_digits(int) && all_digits(frac),
        None => !digits.is_empty() && all_digits(digits),
    }
}

fn scalar_text(value: &Value, op: &OperatorDefinition) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::InvalidValue {
            operator: op.to_string(),
            reason: format!("expected a string or number, got {}", other),
        }),
    }
}

fn list_values(value: &Value, op: &OperatorDefinition) -> Result<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(Error::InvalidValue {
            operator: op.to_string(),
            reason: format!("expected an array, got {}", value),
        });
    };
    items.iter().map(|item| scalar_text(item, op)).collect()
}

// ============================================================================
// FILTER COMPILER
// ============================================================================

/// Accumulates ` AND (<expr>)` fragments and their parameters for one request
#[derive(Debug, Clone, Default)]
pub struct FilterCompiler {
    where_sql: String,
    params: Vec<SqlParam>,
}

/// How per-column predicates combine when `not_` is applied
enum Negation {
    /// `NOT (col op ?)`, ANDed across columns
    PerColumn,
    /// `(NOT (col op ?) OR col IS NULL)`, ANDed across columns
    PerColumnNullSafe,
    /// `NOT (<whole expression>)`
    Whole,
}

fn expand(columns: &[&str], template: &str) -> Vec<String> {
    columns
        .iter()
        .map(|column| template.replace("%%", column))
        .collect()
}

impl FilterCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the wire shape `{field: scalar | {operator: value, ...}, ...}`.
    /// A bare scalar means `=`.
    pub fn from_json(filter: &Value) -> Result<Self> {
        let Value::Object(entries) = filter else {
            return Err(Error::InvalidValue {
                operator: "filter".to_string(),
                reason: format!("expected an object, got {}", filter),
            });
        };

        let mut compiler = Self::new();
        for (field, conditions) in entries {
            match conditions {
                Value::Object(operators) => {
                    for (operator, value) in operators {
                        compiler.process_filter(field, operator, value)?;
                    }
                }
                scalar => compiler.process_filter(field, "=", scalar)?,
            }
        }
        Ok(compiler)
    }

    pub fn parse_json(filter: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(filter)?;
        Self::from_json(&value)
    }

    pub fn where_sql(&self) -> &str {
        &self.where_sql
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    pub fn into_parts(self) -> (String, Vec<SqlParam>) {
        (self.where_sql, self.params)
    }

    pub fn reset(&mut self) {
        self.where_sql.clear();
        self.params.clear();
    }

    /// Append one `AND (<expr>)` for `field operator value`.
    /// Nothing is appended when an error is returned.
    pub fn process_filter(&mut self, field: &str, operator: &str, value: &Value) -> Result<()> {
        let field = validate_filter_field(field)?;
        let op = OperatorDefinition::parse(operator)?;
        let columns = physical_columns(field);
        if columns.is_empty() {
            return Err(Error::InvalidField(field.to_string()));
        }

        let (expr, params) = match op.kind {
            OperatorKind::Compare(cmp) => {
                let value = scalar_text(value, &op)?;
                if op.abs && (field == "datetime" || !is_numeric(&value)) {
                    return Err(Error::InvalidValue {
                        operator: op.to_string(),
                        reason: "abs applies to numeric comparisons only".to_string(),
                    });
                }
                let column = if op.abs { "ABS(%%)" } else { "%%" };
                let template = if field == "datetime" {
                    format!("date(%%) {} date(?)", cmp.as_sql())
                } else if is_numeric(&value) {
                    format!("{} {} CAST(? AS NUMERIC)", column, cmp.as_sql())
                } else {
                    format!("{} {} ?", column, cmp.as_sql())
                };
                Self::combine(&columns, &template, vec![value.into()], &op, Negation::PerColumn)
            }
            OperatorKind::StartsWith | OperatorKind::EndsWith | OperatorKind::Contains => {
                let value = scalar_text(value, &op)?;
                let pattern = match op.kind {
                    OperatorKind::StartsWith => format!("{}%", value),
                    OperatorKind::EndsWith => format!("%{}", value),
                    _ => format!("%{}%", value),
                };
                Self::combine(
                    &columns,
                    "%% LIKE ?",
                    vec![pattern.into()],
                    &op,
                    Negation::PerColumnNullSafe,
                )
            }
            OperatorKind::Regex => {
                let value = regex_value(&scalar_text(value, &op)?, &op)?;
                Self::combine(
                    &columns,
                    "%% REGEXP ?",
                    vec![value.into()],
                    &op,
                    Negation::PerColumnNullSafe,
                )
            }
            OperatorKind::In => {
                let values: Vec<SqlParam> = list_values(value, &op)?
                    .into_iter()
                    .map(SqlParam::Text)
                    .collect();
                let placeholders = vec!["?"; values.len()].join(",");
                if is_tag_field(field) {
                    let template = format!(
                        "EXISTS (SELECT 1 FROM json_each(main.%%) WHERE value IN ({}))",
                        placeholders
                    );
                    Self::combine(&columns, &template, values, &op, Negation::Whole)
                } else {
                    let template = format!("%% IN ({})", placeholders);
                    Self::combine(&columns, &template, values, &op, Negation::PerColumnNullSafe)
                }
            }
            OperatorKind::Empty => {
                // a logical field is empty only when all of its columns are
                let parts = expand(&columns, "(%% IS NULL OR %% = '' OR %% = '[]')");
                let joined = parts.join(" AND ");
                let expr = if op.not {
                    format!("NOT ({})", joined)
                } else {
                    joined
                };
                (expr, Vec::new())
            }
        };

        self.where_sql.push_str(&format!(" AND ({})", expr));
        self.params.extend(params);
        Ok(())
    }

    fn combine(
        columns: &[&str],
        template: &str,
        values: Vec<SqlParam>,
        op: &OperatorDefinition,
        negation: Negation,
    ) -> (String, Vec<SqlParam>) {
        let parts = expand(columns, template);
        let params: Vec<SqlParam> = columns
            .iter()
            .flat_map(|_| values.iter().cloned())
            .collect();

        if !op.not {
            return (parts.join(" OR "), params);
        }

        let expr = match negation {
            Negation::PerColumn => parts
                .iter()
                .map(|part| format!("NOT ({})", part))
                .collect::<Vec<_>>()
                .join(" AND "),
            Negation::PerColumnNullSafe => parts
                .iter()
                .zip(columns)
                .map(|(part, column)| format!("(NOT ({}) OR {} IS NULL)", part, column))
                .collect::<Vec<_>>()
                .join(" AND "),
            Negation::Whole => format!("NOT ({})", parts.join(" OR ")),
        };
        (expr, params)
    }
}

// ============================================================================
// TESTS
// ============================================================================
