// ⚠️ Error taxonomy for rule/filter compilation, classification and storage

use crate::lexer::{Position, TokenKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid syntax at {position}: unexpected {found:?}")]
    Lex { position: Position, found: String },

    #[error("Field '{field}' is not allowed in {rule}")]
    UnknownField { field: String, rule: String },

    #[error("Unhandled token {kind} ({text:?}) at {position}")]
    UnhandledToken {
        kind: TokenKind,
        text: String,
        position: Position,
    },

    #[error("Unbalanced parentheses in rule: {0}")]
    UnbalancedParentheses(String),

    #[error("Rule ends before the condition is complete: {0}")]
    IncompleteRule(String),

    #[error("Invalid filter field: \"{0}\"")]
    InvalidField(String),

    #[error("Invalid operator: \"{0}\". Expected startsWith, endsWith, contains, regex, in, empty, <, >, etc")]
    InvalidOperator(String),

    #[error("Invalid value for operator \"{operator}\": {reason}")]
    InvalidValue { operator: String, reason: String },

    #[error("Invalid order_by parameter: \"{0}\"")]
    InvalidOrderBy(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("Invalid pattern '{pattern}' for field '{field}': {reason}")]
    InvalidPattern {
        field: String,
        pattern: String,
        reason: String,
    },

    #[error("Malformed rule segment '{segment}': expected 'field: pattern'")]
    MalformedRule { segment: String },

    #[error("No rule record found for id {0}")]
    MissingRule(i64),

    #[error("No transaction found for id {0}")]
    TransactionNotFound(String),

    #[error("Expected to update 1 row in transaction for {id}, but updated {changes}")]
    Integrity { id: String, changes: usize },

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors caused by the caller's input (rule text, filter, paging).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Lex { .. }
                | Error::UnknownField { .. }
                | Error::UnhandledToken { .. }
                | Error::UnbalancedParentheses(_)
                | Error::IncompleteRule(_)
                | Error::InvalidField(_)
                | Error::InvalidOperator(_)
                | Error::InvalidValue { .. }
                | Error::InvalidOrderBy(_)
                | Error::InvalidPagination(_)
                | Error::InvalidPattern { .. }
                | Error::MalformedRule { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::MissingRule(_) | Error::TransactionNotFound(_))
    }
}
