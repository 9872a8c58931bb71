// 🏷️ SQL Rule Application - run stored rules as predicates and merge their tags

use crate::db::parse_json_list;
use crate::error::{Error, Result};
use crate::predicate::{CompiledPredicate, SqlParam};
use crate::query::TRANSACTION_VIEW;
use crate::rule_sql;
use crate::rule_store::{self, Rule};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use tracing::{info, warn};

/// A rule skipped during a bulk pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub id: i64,
    pub rule: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub rules_applied: usize,
    pub rows_tagged: usize,
    pub failures: Vec<RuleFailure>,
}

fn id_placeholders(txids: &[String]) -> String {
    vec!["?"; txids.len()].join(", ")
}

/// Append-unique merge, keeping first-seen order
fn merge_unique<T: PartialEq + Clone>(existing: &mut Vec<T>, incoming: &[T]) {
    for item in incoming {
        if !existing.contains(item) {
            existing.push(item.clone());
        }
    }
}

/// Merge `rule` into every matching row. Runs inside the caller's transaction.
fn merge_rule(
    conn: &Connection,
    rule: &Rule,
    compiled: &CompiledPredicate,
    txids: Option<&[String]>,
) -> Result<usize> {
    let mut sql = format!(
        "SELECT id, auto_tags, rule_ids FROM ({}) AS main WHERE 1=1{}",
        TRANSACTION_VIEW,
        compiled.as_where_clause()
    );
    let mut params: Vec<SqlParam> = compiled.params.clone();

    if let Some(ids) = txids.filter(|ids| !ids.is_empty()) {
        sql.push_str(&format!(" AND id IN ({})", id_placeholders(ids)));
        params.extend(ids.iter().map(|id| SqlParam::Text(id.clone())));
    }

    let mut stmt = conn.prepare(&sql)?;
    let matches = stmt
        .query_map(params_from_iter(params), |row| {
            let id: String = row.get(0)?;
            let tags: Option<String> = row.get(1)?;
            let rule_ids: Option<String> = row.get(2)?;
            Ok((id, tags, rule_ids))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let party = if rule.party.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&rule.party)?)
    };

    let mut update = conn.prepare(
        "UPDATE \"transaction\"
         SET tags = ?1, rule_ids = ?2, party = COALESCE(?3, party)
         WHERE id = ?4",
    )?;

    for (id, tags, rule_ids) in &matches {
        let mut tags = parse_json_list(tags.clone());
        merge_unique(&mut tags, &rule.tags);

        let mut rule_ids: Vec<i64> = rule_ids
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        merge_unique(&mut rule_ids, &[rule.id]);

        update.execute(params![
            serde_json::to_string(&tags)?,
            serde_json::to_string(&rule_ids)?,
            party,
            id
        ])?;
    }

    Ok(matches.len())
}

fn clear_tags_in(conn: &Connection, txids: Option<&[String]>) -> Result<usize> {
    let reset = "UPDATE \"transaction\" SET tags = '[]', party = '[]', rule_ids = '[]'";
    let changes = match txids.filter(|ids| !ids.is_empty()) {
        Some(ids) => conn.execute(
            &format!("{} WHERE id IN ({})", reset, id_placeholders(ids)),
            params_from_iter(ids),
        )?,
        None => conn.execute(reset, [])?,
    };
    Ok(changes)
}

/// Apply one rule to all rows (or only `txids`); returns matched rows
pub fn apply_rule(conn: &Connection, rule: &Rule, txids: Option<&[String]>) -> Result<usize> {
    let compiled = rule_sql::compile(&rule.rule)?;

    let tx = conn.unchecked_transaction()?;
    let count = merge_rule(&tx, rule, &compiled, txids)?;
    tx.commit()?;

    info!(id = rule.id, matched = count, "rule applied");
    Ok(count)
}

/// Reset tags, party and rule ids of all rows (or only `txids`)
pub fn clear_tags(conn: &Connection, txids: Option<&[String]>) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let changes = clear_tags_in(&tx, txids)?;
    tx.commit()?;
    Ok(changes)
}

fn record_failure(report: &mut ApplyReport, rule: &Rule, error: &Error) {
    warn!(id = rule.id, rule = %rule.rule, error = %error, "rule processing failed");
    report.failures.push(RuleFailure {
        id: rule.id,
        rule: rule.rule.clone(),
        error: error.to_string(),
    });
}

/// Clear, then apply every stored rule. A rule that fails to compile or to
/// run is rolled back on its own, reported and skipped.
pub fn apply_all_rules(conn: &Connection, txids: Option<&[String]>) -> Result<ApplyReport> {
    let rules = rule_store::list_rules(conn)?;
    let mut report = ApplyReport::default();

    let mut tx = conn.unchecked_transaction()?;
    clear_tags_in(&tx, txids)?;

    // oldest first so merged tag order follows rule creation order
    for summary in rules.iter().rev() {
        let rule = &summary.rule;
        let compiled = match rule_sql::compile(&rule.rule) {
            Ok(compiled) => compiled,
            Err(e) => {
                record_failure(&mut report, rule, &e);
                continue;
            }
        };

        let savepoint = tx.savepoint()?;
        match merge_rule(&savepoint, rule, &compiled, txids) {
            Ok(count) => {
                savepoint.commit()?;
                report.rows_tagged += count;
                report.rules_applied += 1;
            }
            // dropping the savepoint rolls back this rule's partial writes
            Err(e) => record_failure(&mut report, rule, &e),
        }
    }
    tx.commit()?;

    info!(
        rules_applied = report.rules_applied,
        rows_tagged = report.rows_tagged,
        failures = report.failures.len(),
        "all rules applied"
    );
    Ok(report)
}

pub fn apply_one_rule(conn: &Connection, id: i64) -> Result<usize> {
    let rule = rule_store::get_rule(conn, id)?;
    apply_rule(conn, &rule, None)
}

/// Ids of transactions tagged by rule `id`
pub fn transactions_matching_rule(conn: &Connection, id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT t.id
         FROM \"transaction\" t
         WHERE EXISTS (SELECT 1 FROM json_each(t.rule_ids) WHERE json_each.value = ?1)
         ORDER BY t.id",
    )?;
    let ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::get_transaction;
    use crate::db::tests::seeded_connection;
    use crate::rule_store::{create_rule, NewRule};

    fn new_rule(rule: &str, tags: &[&str], party: &[&str]) -> NewRule {
        NewRule {
            rule: rule.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            party: party.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_rule_merges_tags_and_ids() {
        let conn = seeded_connection();
        let deposits = create_rule(&conn, &new_rule("type = DEP", &["Deposit"], &[])).unwrap();
        let coffee =
            create_rule(&conn, &new_rule("description = 'coffee'", &["Food", "Deposit"], &["Cafe"]))
                .unwrap();

        assert_eq!(apply_rule(&conn, &deposits, None).unwrap(), 2);
        assert_eq!(apply_rule(&conn, &coffee, None).unwrap(), 1);
        // re-applying does not duplicate
        assert_eq!(apply_rule(&conn, &coffee, None).unwrap(), 1);

        let tx2 = get_transaction(&conn, "tx2").unwrap().unwrap();
        assert_eq!(tx2.tags, vec!["Deposit".to_string(), "Food".to_string()]);
        assert_eq!(tx2.party, vec!["Cafe".to_string()]);

        let tx1 = get_transaction(&conn, "tx1").unwrap().unwrap();
        assert_eq!(tx1.tags, vec!["Deposit".to_string()]);
        assert!(tx1.party.is_empty());

        assert_eq!(
            transactions_matching_rule(&conn, deposits.id).unwrap(),
            vec!["tx1", "tx2"]
        );
        assert_eq!(transactions_matching_rule(&conn, coffee.id).unwrap(), vec!["tx2"]);
        println!("✅ Apply rule test PASSED");
    }

    #[test]
    fn test_apply_rule_limited_to_ids() {
        let conn = seeded_connection();
        let deposits = create_rule(&conn, &new_rule("type = DEP", &["Deposit"], &[])).unwrap();

        let only = vec!["tx2".to_string()];
        assert_eq!(apply_rule(&conn, &deposits, Some(&only)).unwrap(), 1);
        assert!(get_transaction(&conn, "tx1").unwrap().unwrap().tags.is_empty());
    }

    #[test]
    fn test_apply_all_rules_clears_and_collects_failures() {
        let conn = seeded_connection();
        create_rule(&conn, &new_rule("debit > 150", &["Big"], &[])).unwrap();
        create_rule(&conn, &new_rule("type = DEP", &["Deposit"], &[])).unwrap();

        // bypass validation to store a broken rule
        conn.execute(
            "INSERT INTO \"rule\" (rule, tag) VALUES ('secret_column = 1', '[\"X\"]')",
            [],
        )
        .unwrap();
        crate::db::save_tags(&conn, "tx3", &["Stale".to_string()]).unwrap();

        let report = apply_all_rules(&conn, None).unwrap();
        assert_eq!(report.rules_applied, 2);
        assert_eq!(report.rows_tagged, 3);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("secret_column"));

        let tx3 = get_transaction(&conn, "tx3").unwrap().unwrap();
        assert_eq!(tx3.tags, vec!["Big".to_string()]);
    }

    #[test]
    fn test_apply_all_rules_survives_failing_regex() {
        let conn = seeded_connection();
        assert!(matches!(
            create_rule(&conn, &new_rule("description = /(/", &["Broken"], &[])),
            Err(Error::InvalidPattern { .. })
        ));

        create_rule(&conn, &new_rule("type = DEP", &["Deposit"], &[])).unwrap();
        // stored by an older version that did not check patterns
        conn.execute(
            "INSERT INTO \"rule\" (rule, tag) VALUES ('description = /(/', '[\"X\"]')",
            [],
        )
        .unwrap();

        let report = apply_all_rules(&conn, None).unwrap();
        assert_eq!(report.rules_applied, 1);
        assert_eq!(report.rows_tagged, 2);
        assert_eq!(report.failures.len(), 1);

        assert_eq!(
            get_transaction(&conn, "tx1").unwrap().unwrap().tags,
            vec!["Deposit".to_string()]
        );
        println!("✅ Apply all rules with a broken regex PASSED");
    }

    #[test]
    fn test_clear_tags_subset() {
        let conn = seeded_connection();
        let deposits = create_rule(&conn, &new_rule("type = DEP", &["Deposit"], &[])).unwrap();
        apply_rule(&conn, &deposits, None).unwrap();

        assert_eq!(clear_tags(&conn, Some(&["tx1".to_string()])).unwrap(), 1);
        assert!(get_transaction(&conn, "tx1").unwrap().unwrap().tags.is_empty());
        assert_eq!(
            get_transaction(&conn, "tx2").unwrap().unwrap().tags,
            vec!["Deposit".to_string()]
        );
        assert_eq!(transactions_matching_rule(&conn, deposits.id).unwrap(), vec!["tx2"]);
    }

    #[test]
    fn test_apply_one_rule_missing() {
        let conn = seeded_connection();
        assert!(matches!(apply_one_rule(&conn, 42), Err(Error::MissingRule(42))));
    }
}
