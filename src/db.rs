// 🗄️ Storage - SQLite schema, REGEXP function, transaction reads/writes
// Every function takes the connection explicitly; there is no shared handle.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ============================================================================
// TRANSACTION
// ============================================================================

/// Fields a classifier rule may reference
pub const TRANSACTION_FIELDS: [&str; 11] = [
    "id",
    "datetime",
    "account",
    "description",
    "credit",
    "debit",
    "balance",
    "amount",
    "type",
    "tags",
    "party",
];

/// Bank transaction as stored in the `transaction` table.
/// Also the CSV import record; tags and party are produced by classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub id: String,
    pub datetime: String,
    pub account: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub credit: Option<f64>,
    #[serde(default)]
    pub debit: Option<f64>,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(skip)]
    pub tags: Vec<String>,
    #[serde(skip)]
    pub party: Vec<String>,
}

/// Field value as seen by the in-memory matcher
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl FieldValue {
    /// Numeric view; text is parsed, unparsable text has none
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Text(s) => Cow::Borrowed(s),
            FieldValue::Number(n) => Cow::Owned(n.to_string()),
        }
    }
}

impl Transaction {
    /// Stable id for imported rows (same row → same id)
    pub fn compute_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{:?}|{:?}",
            self.datetime,
            self.account,
            self.description.as_deref().unwrap_or_default(),
            self.credit,
            self.debit
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Signed amount: debits negative, credits positive
    pub fn amount(&self) -> f64 {
        match (self.debit, self.credit) {
            (Some(debit), _) if debit > 0.0 => -debit,
            (_, Some(credit)) if credit > 0.0 => credit,
            _ => 0.0,
        }
    }

    /// Look up a field by its rule name
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        let text = |s: &str| Some(FieldValue::Text(s.to_string()));
        match name {
            "id" => text(&self.id),
            "datetime" => text(&self.datetime),
            "account" => text(&self.account),
            "description" => self.description.as_deref().and_then(text),
            "credit" => self.credit.map(FieldValue::Number),
            "debit" => self.debit.map(FieldValue::Number),
            "balance" => self.balance.map(FieldValue::Number),
            "amount" => Some(FieldValue::Number(self.amount())),
            "type" => self.kind.as_deref().and_then(text),
            "tags" => text(&self.tags.join(",")),
            "party" => text(&self.party.join(",")),
            _ => None,
        }
    }
}

// ============================================================================
// CONNECTION SETUP
// ============================================================================

/// Open (or create) the database file and prepare it for use
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    register_functions(&conn)?;
    setup_database(&conn)?;
    info!(path = %path.display(), "database opened");
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    register_functions(&conn)?;
    setup_database(&conn)?;
    Ok(conn)
}

/// Register `REGEXP` (`x REGEXP p` calls `regexp(p, x)`).
/// Patterns are case-sensitive unless they carry inline flags such as `(?i)`.
pub fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<Regex> =
                ctx.get_or_create_aux(0, |vr| -> std::result::Result<Regex, BoxError> {
                    Ok(Regex::new(vr.as_str()?)?)
                })?;

            let is_match = match ctx.get_raw(1) {
                ValueRef::Null => return Ok(None),
                ValueRef::Text(bytes) => re.is_match(&String::from_utf8_lossy(bytes)),
                ValueRef::Integer(i) => re.is_match(&i.to_string()),
                ValueRef::Real(f) => re.is_match(&f.to_string()),
                ValueRef::Blob(_) => false,
            };
            Ok(Some(is_match))
        },
    )?;
    Ok(())
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for file databases; in-memory databases report "memory"
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "journal mode set");

    // ==========================================================================
    // Transactions (imported rows + automatic tags/party)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS \"transaction\" (
            id TEXT PRIMARY KEY NOT NULL,
            datetime TEXT NOT NULL,
            account TEXT NOT NULL,
            description TEXT,
            credit REAL,
            debit REAL,
            balance REAL,
            type TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            party TEXT NOT NULL DEFAULT '[]',
            rule_ids TEXT NOT NULL DEFAULT '[]',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Manual edits (revised description, manual tags/party)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transaction_enriched (
            id TEXT PRIMARY KEY NOT NULL,
            description TEXT,
            tags TEXT,
            party TEXT,
            auto_categorize INTEGER
        )",
        [],
    )?;

    // ==========================================================================
    // Rules (SQL-flavoured rule text + tags/party it applies)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS \"rule\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule TEXT NOT NULL,
            \"group\" TEXT,
            tag TEXT NOT NULL DEFAULT '[]',
            party TEXT NOT NULL DEFAULT '[]',
            comment TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transaction_datetime ON \"transaction\"(datetime)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transaction_account ON \"transaction\"(account)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TRANSACTION READS / WRITES
// ============================================================================

/// Lenient JSON string-array column decoding
pub(crate) fn parse_json_list(text: Option<String>) -> Vec<String> {
    text.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Insert transactions, skipping ids already present
pub fn insert_transactions(conn: &Connection, transactions: &[Transaction]) -> Result<usize> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for tx in transactions {
        let id = if tx.id.is_empty() {
            tx.compute_id()
        } else {
            tx.id.clone()
        };

        let result = conn.execute(
            "INSERT INTO \"transaction\" (
                id, datetime, account, description, credit, debit, balance, type, tags, party
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                tx.datetime,
                tx.account,
                tx.description,
                tx.credit,
                tx.debit,
                tx.balance,
                tx.kind,
                serde_json::to_string(&tx.tags)?,
                serde_json::to_string(&tx.party)?,
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(inserted, duplicates, "transactions imported");
    Ok(inserted)
}

/// Record a manual edit for a transaction
pub fn upsert_enrichment(
    conn: &Connection,
    id: &str,
    description: Option<&str>,
    tags: &[String],
) -> Result<()> {
    conn.execute(
        "INSERT INTO transaction_enriched (id, description, tags)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET description = excluded.description, tags = excluded.tags",
        params![id, description, serde_json::to_string(tags)?],
    )?;
    Ok(())
}

pub fn get_transaction(conn: &Connection, id: &str) -> Result<Option<Transaction>> {
    let tx = conn
        .query_row(
            "SELECT id, datetime, account, description, credit, debit, balance, type, tags, party
             FROM \"transaction\"
             WHERE id = ?1",
            [id],
            |row| {
                Ok(Transaction {
                    id: row.get(0)?,
                    datetime: row.get(1)?,
                    account: row.get(2)?,
                    description: row.get(3)?,
                    credit: row.get(4)?,
                    debit: row.get(5)?,
                    balance: row.get(6)?,
                    kind: row.get(7)?,
                    tags: parse_json_list(row.get(8)?),
                    party: parse_json_list(row.get(9)?),
                })
            },
        )
        .optional()?;

    Ok(tx)
}

pub fn all_transaction_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM \"transaction\" ORDER BY datetime, id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Overwrite the automatic tags of one transaction
pub fn save_tags(conn: &Connection, id: &str, tags: &[String]) -> Result<()> {
    let changes = conn.execute(
        "UPDATE \"transaction\" SET tags = ?1 WHERE id = ?2",
        params![serde_json::to_string(tags)?, id],
    )?;

    if changes != 1 {
        return Err(Error::Integrity {
            id: id.to_string(),
            changes,
        });
    }
    Ok(())
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM \"transaction\"", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// CSV SEED LOADER
// ============================================================================

/// Normalize the date formats banks export to `YYYY-MM-DDTHH:MM:SS`
fn normalize_datetime(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let format = "%Y-%m-%dT%H:%M:%S";

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local().format(format).to_string());
    }
    for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(dt.format(format).to_string());
        }
    }
    for pattern in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, pattern) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.format(format).to_string());
        }
    }
    None
}

/// Load transactions from a CSV with headers
/// `id,datetime,account,description,credit,debit,balance,type` (`id` optional)
pub fn load_csv(csv_path: &Path) -> Result<Vec<Transaction>> {
    let mut rdr = csv::Reader::from_path(csv_path)?;

    let mut transactions = Vec::new();

    for result in rdr.deserialize() {
        let mut transaction: Transaction = result?;

        match normalize_datetime(&transaction.datetime) {
            Some(normalized) => transaction.datetime = normalized,
            None => warn!(datetime = %transaction.datetime, "unrecognized date format, kept as is"),
        }
        if transaction.id.is_empty() {
            transaction.id = transaction.compute_id();
        }

        transactions.push(transaction);
    }

    debug!(count = transactions.len(), path = %csv_path.display(), "csv loaded");
    Ok(transactions)
}

// ============================================================================
// TESTS
// ============================================================================
