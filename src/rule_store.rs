// 📚 Rule Store - persisted rules, validated by compiling before every write

use crate::db::parse_json_list;
use crate::error::{Error, Result};
use crate::rule_sql;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Stored rule: rule text plus the tags / party it assigns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub id: i64,
    pub rule: String,
    pub group: Option<String>,
    pub tags: Vec<String>,
    pub party: Vec<String>,
    pub comment: Option<String>,
}

/// Rule listing entry with the number of transactions it tagged
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSummary {
    #[serde(flatten)]
    pub rule: Rule,
    pub tx_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewRule {
    pub rule: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default, alias = "tag")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub party: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Partial update; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RulePatch {
    pub rule: Option<String>,
    pub group: Option<String>,
    #[serde(alias = "tag")]
    pub tags: Option<Vec<String>>,
    pub party: Option<Vec<String>>,
    pub comment: Option<String>,
}

const RULE_COLUMNS: &str = "id, rule, \"group\", tag, party, comment";

fn rule_from_row(row: &Row) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: row.get(0)?,
        rule: row.get(1)?,
        group: row.get(2)?,
        tags: parse_json_list(row.get(3)?),
        party: parse_json_list(row.get(4)?),
        comment: row.get(5)?,
    })
}

pub fn create_rule(conn: &Connection, new_rule: &NewRule) -> Result<Rule> {
    rule_sql::compile(&new_rule.rule)?;

    conn.execute(
        "INSERT INTO \"rule\" (rule, \"group\", tag, party, comment) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            new_rule.rule,
            new_rule.group,
            serde_json::to_string(&new_rule.tags)?,
            serde_json::to_string(&new_rule.party)?,
            new_rule.comment,
        ],
    )?;
    let id = conn.last_insert_rowid();

    info!(id, rule = %new_rule.rule, "rule created");
    get_rule(conn, id)
}

pub fn get_rule(conn: &Connection, id: i64) -> Result<Rule> {
    conn.query_row(
        &format!("SELECT {} FROM \"rule\" WHERE id = ?1", RULE_COLUMNS),
        [id],
        rule_from_row,
    )
    .optional()?
    .ok_or(Error::MissingRule(id))
}

/// Update the given fields; a new rule text must compile first
pub fn update_rule(conn: &Connection, id: i64, patch: &RulePatch) -> Result<Rule> {
    get_rule(conn, id)?;

    if let Some(rule) = &patch.rule {
        rule_sql::compile(rule)?;
    }

    let tags = patch.tags.as_ref().map(serde_json::to_string).transpose()?;
    let party = patch.party.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "UPDATE \"rule\" SET
            rule = COALESCE(?1, rule),
            \"group\" = COALESCE(?2, \"group\"),
            tag = COALESCE(?3, tag),
            party = COALESCE(?4, party),
            comment = COALESCE(?5, comment)
         WHERE id = ?6",
        params![patch.rule, patch.group, tags, party, patch.comment, id],
    )?;

    info!(id, "rule updated");
    get_rule(conn, id)
}

pub fn delete_rule(conn: &Connection, id: i64) -> Result<()> {
    let changes = conn.execute("DELETE FROM \"rule\" WHERE id = ?1", [id])?;
    if changes == 0 {
        return Err(Error::MissingRule(id));
    }
    info!(id, "rule deleted");
    Ok(())
}

/// All rules, newest first, with the count of transactions carrying their id
pub fn list_rules(conn: &Connection) -> Result<Vec<RuleSummary>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.rule, r.\"group\", r.tag, r.party, r.comment,
                COUNT(DISTINCT matched.id) AS tx_count
         FROM \"rule\" r
         LEFT JOIN (
             SELECT t.id, j.value AS rule_id
             FROM \"transaction\" t, json_each(t.rule_ids) j
         ) matched ON r.id = matched.rule_id
         GROUP BY r.id
         ORDER BY r.id DESC",
    )?;

    let rules = stmt
        .query_map([], |row| {
            Ok(RuleSummary {
                rule: rule_from_row(row)?,
                tx_count: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rules)
}

// ============================================================================
// TESTS
// ============================================================================
