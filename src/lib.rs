// Tagledger - Core Library
// Rule/filter compilation, classification and storage for bank transactions

pub mod error;
pub mod lexer;
pub mod predicate;
pub mod rule_sql;     // Rule text → SQL WHERE fragment
pub mod filter;       // Structured filter → SQL WHERE fragments
pub mod db;
pub mod query;        // Transaction view queries + summary
pub mod rule_store;
pub mod rule_apply;   // Stored rules executed as SQL
pub mod classifier;   // `field: pattern` rules evaluated in memory
pub mod settings;

// Re-export commonly used types
pub use error::{Error, Result};
pub use lexer::{tokenize, Lexer, Position, Token, TokenKind};
pub use predicate::{CompiledPredicate, SqlParam};
pub use rule_sql::{compile, validate_rule_field, RULE_FIELDS};
pub use filter::{
    validate_filter_field, CompareOp, FilterCompiler, OperatorDefinition, OperatorKind,
    FILTER_FIELDS,
};
pub use db::{
    Transaction, FieldValue,
    open_database, open_in_memory, setup_database, register_functions,
    insert_transactions, upsert_enrichment, get_transaction, all_transaction_ids,
    save_tags, verify_count, load_csv,
};
pub use query::{PageLimits, QueryParams, QuerySummary, TransactionQuery, TransactionRow};
pub use rule_store::{
    create_rule, delete_rule, get_rule, list_rules, update_rule,
    NewRule, Rule, RulePatch, RuleSummary,
};
pub use rule_apply::{
    apply_all_rules, apply_one_rule, apply_rule, clear_tags, transactions_matching_rule,
    ApplyReport, RuleFailure,
};
pub use classifier::{
    check_transaction, classify, classify_all_transactions, classify_id, parse_rule,
    reload_and_reclassify, ClassifyReport, PatternCache, RuleComponent, RuleSet, RuleSource,
};
pub use settings::Settings;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
