// 🧩 Compiled predicates - SQL fragment + positionally bound parameters

use rusqlite::types::{ToSql, ToSqlOutput};
use serde::Serialize;
use std::fmt;

/// A scalar bound to a `?` placeholder
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => s.to_sql(),
            SqlParam::Integer(i) => i.to_sql(),
            SqlParam::Real(f) => f.to_sql(),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Integer(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Text(s) => write!(f, "'{}'", s),
            SqlParam::Integer(i) => write!(f, "{}", i),
            SqlParam::Real(r) => write!(f, "{}", r),
        }
    }
}

/// Output of the rule compiler.
/// Invariant: `placeholder_count(&sql) == params.len()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompiledPredicate {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub uses_regex: bool,
}

impl CompiledPredicate {
    /// Fragment ready to follow `WHERE 1=1`
    pub fn as_where_clause(&self) -> String {
        format!(" AND ({})", self.sql)
    }
}

/// Count `?` placeholders outside of single-quoted SQL literals
pub fn placeholder_count(sql: &str) -> usize {
    let mut in_literal = false;
    let mut count = 0;
    for c in sql.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '?' if !in_literal => count += 1,
            _ => {}
        }
    }
    count
}
