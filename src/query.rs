// 📋 Transaction Query - rule / filter / ORDER BY / LIMIT-OFFSET against the transaction view
//
// Every request builds a fresh accumulator. Fragments are appended after
// `WHERE 1=1` and each one starts with a leading space.

use crate::db::parse_json_list;
use crate::error::{Error, Result};
use crate::filter::FilterCompiler;
use crate::predicate::SqlParam;
use crate::rule_sql;
use crate::rule_store;
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// SQL
// ============================================================================

/// Transactions merged with their manual edits.
/// `amount` is cast so bound text parameters compare numerically.
pub const TRANSACTION_VIEW: &str = "
    SELECT
        t.id,
        t.datetime,
        t.account,
        t.description AS orig_description,
        te.description AS revised_description,
        CASE
            WHEN te.description IS NOT NULL AND te.description != '' THEN te.description
            ELSE t.description
        END AS description,
        t.credit,
        t.debit,
        CAST(CASE
            WHEN t.debit > 0.0 THEN -t.debit
            WHEN t.credit > 0.0 THEN t.credit
            ELSE 0.0
        END AS REAL) AS amount,
        t.balance,
        t.type,
        CASE WHEN t.tags = '' OR t.tags IS NULL THEN '[]' ELSE t.tags END AS tags,
        CASE WHEN t.tags = '' OR t.tags IS NULL THEN '[]' ELSE t.tags END AS auto_tags,
        CASE WHEN te.tags = '' OR te.tags IS NULL THEN '[]' ELSE te.tags END AS manual_tags,
        CASE
            WHEN te.party IS NOT NULL AND te.party != '' AND te.party != '[]' THEN te.party
            WHEN t.party = '' OR t.party IS NULL THEN '[]'
            ELSE t.party
        END AS party,
        t.rule_ids,
        te.auto_categorize
    FROM \"transaction\" t
    LEFT JOIN transaction_enriched te ON t.id = te.id
";

pub fn all_transactions_query() -> String {
    format!("SELECT * FROM ({}) AS main WHERE 1=1", TRANSACTION_VIEW)
}

pub fn size_query() -> String {
    format!(
        "SELECT count(id) AS cnt, sum(amount) AS amount_total, sum(credit) AS credit_total, sum(debit) AS debit_total
         FROM ({}) AS main WHERE 1=1",
        TRANSACTION_VIEW
    )
}

pub const DEFAULT_ORDER_BY: &str = " ORDER BY datetime DESC";

/// Columns accepted by `order_by`
pub const SORT_COLUMNS: [&str; 10] = [
    "datetime",
    "account",
    "description",
    "credit",
    "debit",
    "amount",
    "balance",
    "type",
    "tags",
    "manual_tags",
];

// ============================================================================
// PARAMETERS
// ============================================================================

/// Request parameters, as they arrive on the query string
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub rule: Option<String>,
    pub ruleid: Option<i64>,
    /// Filter object as JSON text
    pub filter: Option<String>,
    /// `"column,direction"`
    pub order_by: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: 1000,
            max_page_size: 10000,
        }
    }
}

/// Validate `"column,direction"` into an ` ORDER BY` clause
pub fn order_by_clause(order_by: &str) -> Result<String> {
    let invalid = || Error::InvalidOrderBy(order_by.to_string());

    let (column, direction) = match order_by.split_once(',') {
        Some((column, direction)) => (column.trim(), direction.trim()),
        None => (order_by.trim(), "asc"),
    };

    let column = SORT_COLUMNS
        .iter()
        .find(|allowed| allowed.eq_ignore_ascii_case(column))
        .ok_or_else(invalid)?;

    let direction = match direction.to_ascii_lowercase().as_str() {
        "asc" => "ASC",
        "desc" => "DESC",
        _ => return Err(invalid()),
    };

    Ok(format!(" ORDER BY {} {}", column, direction))
}

// ============================================================================
// RESULTS
// ============================================================================

/// One row of the transaction view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRow {
    pub id: String,
    pub datetime: String,
    pub account: String,
    pub description: Option<String>,
    pub orig_description: Option<String>,
    pub revised_description: Option<String>,
    pub credit: Option<f64>,
    pub debit: Option<f64>,
    pub amount: f64,
    pub balance: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub auto_tags: Vec<String>,
    pub manual_tags: Vec<String>,
    pub party: Vec<String>,
    pub rule_ids: Vec<i64>,
}

impl TransactionRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let rule_ids: Option<String> = row.get("rule_ids")?;
        Ok(TransactionRow {
            id: row.get("id")?,
            datetime: row.get("datetime")?,
            account: row.get("account")?,
            description: row.get("description")?,
            orig_description: row.get("orig_description")?,
            revised_description: row.get("revised_description")?,
            credit: row.get("credit")?,
            debit: row.get("debit")?,
            amount: row.get("amount")?,
            balance: row.get("balance")?,
            kind: row.get("type")?,
            auto_tags: parse_json_list(row.get("auto_tags")?),
            manual_tags: parse_json_list(row.get("manual_tags")?),
            party: parse_json_list(row.get("party")?),
            rule_ids: rule_ids
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySummary {
    pub pages: u64,
    pub count: i64,
    pub debit_total: f64,
    pub credit_total: f64,
    pub amount_total: f64,
    pub page: u32,
    pub page_size: u32,
}

// ============================================================================
// QUERY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionQuery {
    where_sql: String,
    params: Vec<SqlParam>,
    order_by: String,
    limit: String,
    limit_params: Vec<SqlParam>,
    page: u32,
    page_size: u32,
}

impl TransactionQuery {
    /// Process rule id / rule, filter, order_by and pagination in that order.
    /// A raw `rule` takes precedence over `ruleid`.
    pub fn build(conn: &Connection, params: &QueryParams, limits: &PageLimits) -> Result<Self> {
        let mut query = TransactionQuery {
            where_sql: String::new(),
            params: Vec::new(),
            order_by: String::new(),
            limit: String::new(),
            limit_params: Vec::new(),
            page: 1,
            page_size: limits.default_page_size,
        };

        // Rule
        let mut rule = None;
        if let Some(id) = params.ruleid {
            rule = Some(rule_store::get_rule(conn, id)?.rule);
        }
        if let Some(raw) = params.rule.as_deref().filter(|r| !r.trim().is_empty()) {
            rule = Some(raw.to_string());
        }
        if let Some(rule) = rule {
            let compiled = rule_sql::compile(&rule)?;
            query.where_sql.push_str(&compiled.as_where_clause());
            query.params.extend(compiled.params);
        }

        // Filter
        if let Some(filter) = params.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            let (where_sql, filter_params) = FilterCompiler::parse_json(filter)?.into_parts();
            query.where_sql.push_str(&where_sql);
            query.params.extend(filter_params);
        }

        // Order by
        query.order_by = match params.order_by.as_deref() {
            Some(order_by) if !order_by.trim().is_empty() => order_by_clause(order_by)?,
            _ => DEFAULT_ORDER_BY.to_string(),
        };

        // Pagination
        let page = params.page.unwrap_or(1);
        if page < 1 {
            return Err(Error::InvalidPagination(format!(
                "page must be >= 1, got {}",
                page
            )));
        }
        let page_size = params.page_size.unwrap_or(limits.default_page_size);
        if page_size < 1 || page_size > limits.max_page_size {
            return Err(Error::InvalidPagination(format!(
                "page_size must be between 1 and {}, got {}",
                limits.max_page_size, page_size
            )));
        }
        query.page = page;
        query.page_size = page_size;
        query.limit = " LIMIT ? OFFSET ?".to_string();
        query.limit_params = vec![
            SqlParam::Integer(page_size as i64),
            SqlParam::Integer((page as i64 - 1) * page_size as i64),
        ];

        debug!(where_sql = %query.where_sql, params = query.params.len(), "transaction query built");
        Ok(query)
    }

    pub fn where_sql(&self) -> &str {
        &self.where_sql
    }

    pub fn order_by(&self) -> &str {
        &self.order_by
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn sql(&self, with_limit: bool) -> String {
        let mut sql = all_transactions_query();
        sql.push_str(&self.where_sql);
        sql.push_str(&self.order_by);
        if with_limit {
            sql.push_str(&self.limit);
        }
        sql
    }

    pub fn count_sql(&self) -> String {
        size_query() + &self.where_sql
    }

    pub fn params(&self, with_limit: bool) -> Vec<SqlParam> {
        let mut params = self.params.clone();
        if with_limit {
            params.extend(self.limit_params.iter().cloned());
        }
        params
    }

    pub fn transactions(&self, conn: &Connection, with_limit: bool) -> Result<Vec<TransactionRow>> {
        let mut stmt = conn.prepare(&self.sql(with_limit))?;
        let rows = stmt
            .query_map(params_from_iter(self.params(with_limit)), |row| {
                TransactionRow::from_row(row)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count and totals over the same WHERE, without ORDER BY / LIMIT
    pub fn summary(&self, conn: &Connection) -> Result<QuerySummary> {
        let (count, amount_total, credit_total, debit_total): (i64, Option<f64>, Option<f64>, Option<f64>) =
            conn.query_row(&self.count_sql(), params_from_iter(self.params(false)), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;

        let page_size = self.page_size.max(1) as i64;
        Ok(QuerySummary {
            pages: ((count + page_size - 1) / page_size) as u64,
            count,
            debit_total: debit_total.unwrap_or(0.0).abs(),
            credit_total: credit_total.unwrap_or(0.0).abs(),
            amount_total: amount_total.unwrap_or(0.0).abs(),
            page: self.page,
            page_size: self.page_size,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::seeded_connection;
    use crate::db::{save_tags, upsert_enrichment};

    fn run(conn: &Connection, params: QueryParams) -> Vec<String> {
        TransactionQuery::build(conn, &params, &PageLimits::default())
            .unwrap()
            .transactions(conn, true)
            .unwrap()
            .into_iter()
            .map(|row| row.id)
            .collect()
    }

    #[test]
    fn test_default_query_orders_by_datetime_desc() {
        let conn = seeded_connection();
        let query = TransactionQuery::build(&conn, &QueryParams::default(), &PageLimits::default()).unwrap();

        assert_eq!(query.where_sql(), "");
        assert_eq!(query.order_by(), " ORDER BY datetime DESC");
        assert!(query.sql(true).ends_with("WHERE 1=1 ORDER BY datetime DESC LIMIT ? OFFSET ?"));
        assert_eq!(
            query.params(true),
            vec![SqlParam::Integer(1000), SqlParam::Integer(0)]
        );
        assert_eq!(run(&conn, QueryParams::default()), vec!["tx3", "tx2", "tx1"]);
        println!("✅ Default query test PASSED");
    }

    #[test]
    fn test_rule_filters_rows() {
        let conn = seeded_connection();

        let params = QueryParams {
            rule: Some("description = 'coffee'".to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx2"]);

        let params = QueryParams {
            rule: Some("amount > 50".to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx1"]);

        let params = QueryParams {
            rule: Some("type = DEP AND debit > 50".to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx2"]);

        let params = QueryParams {
            rule: Some("description = /^(Book|Coffee)/".to_string()),
            order_by: Some("datetime,asc".to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx2", "tx3"]);
    }

    #[test]
    fn test_rule_id_is_fetched() {
        let conn = seeded_connection();
        conn.execute(
            "INSERT INTO \"rule\" (rule, tag) VALUES ('type = DEP', '[\"Deposit\"]')",
            [],
        )
        .unwrap();
        let id = conn.last_insert_rowid();

        let params = QueryParams {
            ruleid: Some(id),
            order_by: Some("datetime,asc".to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx1", "tx2"]);

        let params = QueryParams {
            ruleid: Some(id + 100),
            ..Default::default()
        };
        assert!(matches!(
            TransactionQuery::build(&conn, &params, &PageLimits::default()),
            Err(Error::MissingRule(_))
        ));
    }

    #[test]
    fn test_filter_with_tag_membership_and_manual_edits() {
        let conn = seeded_connection();
        save_tags(&conn, "tx2", &["Food".to_string()]).unwrap();
        upsert_enrichment(&conn, "tx3", Some("Reading material"), &["Food".to_string(), "Books".to_string()]).unwrap();

        let params = QueryParams {
            filter: Some(r#"{"tags":{"in":["Food"]}}"#.to_string()),
            order_by: Some("datetime,asc".to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx2", "tx3"]);

        let params = QueryParams {
            filter: Some(r#"{"tags":{"not_in":["Food"]}}"#.to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx1"]);

        let params = QueryParams {
            filter: Some(r#"{"description":{"contains":"Reading"}}"#.to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx3"]);

        let params = QueryParams {
            filter: Some(r#"{"tags":{"empty":true}}"#.to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx1"]);

        let params = QueryParams {
            filter: Some(r#"{"amount":{"abs>":"150"}}"#.to_string()),
            order_by: Some("amount,desc".to_string()),
            ..Default::default()
        };
        assert_eq!(run(&conn, params), vec!["tx1", "tx3"]);
    }

    #[test]
    fn test_rule_and_filter_params_stay_in_order() {
        let conn = seeded_connection();
        let params = QueryParams {
            rule: Some("type = 'DEP'".to_string()),
            filter: Some(r#"{"amount":{"<":"0"}}"#.to_string()),
            page: Some(2),
            page_size: Some(5),
            ..Default::default()
        };
        let query = TransactionQuery::build(&conn, &params, &PageLimits::default()).unwrap();
        assert_eq!(
            query.where_sql(),
            " AND (type LIKE ?) AND (amount < CAST(? AS NUMERIC))"
        );
        assert_eq!(
            query.params(true),
            vec![
                SqlParam::from("%DEP%"),
                SqlParam::from("0"),
                SqlParam::Integer(5),
                SqlParam::Integer(5),
            ]
        );
    }

    #[test]
    fn test_summary_counts_without_limit() {
        let conn = seeded_connection();
        let params = QueryParams {
            page_size: Some(2),
            ..Default::default()
        };
        let query = TransactionQuery::build(&conn, &params, &PageLimits::default()).unwrap();
        assert_eq!(query.transactions(&conn, true).unwrap().len(), 2);

        let summary = query.summary(&conn).unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.debit_total, 300.0);
        assert_eq!(summary.credit_total, 1000.0);
        assert_eq!(summary.amount_total, 700.0);
        assert_eq!(summary.count as usize, query.transactions(&conn, false).unwrap().len());
    }

    #[test]
    fn test_order_by_and_pagination_validation() {
        assert_eq!(order_by_clause("amount,desc").unwrap(), " ORDER BY amount DESC");
        assert_eq!(order_by_clause(" Type , ASC ").unwrap(), " ORDER BY type ASC");
        assert!(matches!(
            order_by_clause("id; DROP TABLE rule,asc"),
            Err(Error::InvalidOrderBy(_))
        ));
        assert!(matches!(order_by_clause("amount,sideways"), Err(Error::InvalidOrderBy(_))));

        let conn = seeded_connection();
        for params in [
            QueryParams { page: Some(0), ..Default::default() },
            QueryParams { page_size: Some(0), ..Default::default() },
            QueryParams { page_size: Some(10001), ..Default::default() },
        ] {
            assert!(matches!(
                TransactionQuery::build(&conn, &params, &PageLimits::default()),
                Err(Error::InvalidPagination(_))
            ));
        }
    }

    #[test]
    fn test_invalid_filter_field_is_rejected() {
        let conn = seeded_connection();
        let params = QueryParams {
            filter: Some(r#"{"secret_column":"x"}"#.to_string()),
            ..Default::default()
        };
        let err = TransactionQuery::build(&conn, &params, &PageLimits::default()).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_malformed_rule_and_regex_are_client_errors() {
        let conn = seeded_connection();
        let inputs = [
            QueryParams {
                rule: Some("description = /(/".to_string()),
                ..Default::default()
            },
            QueryParams {
                rule: Some("description = 'a' type = 'b'".to_string()),
                ..Default::default()
            },
            QueryParams {
                filter: Some(r#"{"description":{"regex":"("}}"#.to_string()),
                ..Default::default()
            },
        ];
        for params in inputs {
            let err = TransactionQuery::build(&conn, &params, &PageLimits::default()).unwrap_err();
            assert!(err.is_client_error(), "{:?}", err);
        }
        println!("✅ Malformed rule/regex rejection test PASSED");
    }
}
