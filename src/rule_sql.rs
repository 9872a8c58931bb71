// 🛠️ Rule Compiler - rule text → SQL WHERE fragment + bound parameters
//
// Single left-to-right pass over the token stream. The only state kept is the
// last field seen and the comparison waiting for its operand. Connectives are
// copied in source order; there is no precedence handling of its own.

use crate::error::{Error, Result};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::predicate::{placeholder_count, CompiledPredicate, SqlParam};
use regex::Regex;
use tracing::debug;

/// Columns a rule may reference
pub const RULE_FIELDS: [&str; 6] = ["description", "account", "type", "amount", "credit", "debit"];

/// Reject identifiers outside of the rule allowlist
pub fn validate_rule_field(field: &str, rule: &str) -> Result<&'static str> {
    RULE_FIELDS
        .iter()
        .find(|allowed| **allowed == field)
        .copied()
        .ok_or_else(|| Error::UnknownField {
            field: field.to_string(),
            rule: rule.to_string(),
        })
}

/// Compile a rule such as `description = 'Costco' AND amount > 50`
pub fn compile(rule: &str) -> Result<CompiledPredicate> {
    let mut compiler = RuleCompiler::new(rule);
    let mut tokens = tokenize(rule).filter(|t| !matches!(t, Ok(tok) if tok.kind.is_trivia()));

    while let Some(token) = tokens.next() {
        let token = token?;
        if token.kind == TokenKind::In {
            compiler.handle_in(&token, &mut tokens)?;
        } else {
            compiler.handle_token(token)?;
        }
    }

    let predicate = compiler.finish()?;
    debug!(rule, sql = %predicate.sql, params = predicate.params.len(), "compiled rule");
    Ok(predicate)
}

// ============================================================================
// COMPILER STATE
// ============================================================================

/// What the next operand token completes
enum Pending {
    Nothing,
    /// `=`, `<>` or `starts with`: the operand picks LIKE / REGEXP
    Deferred(Token),
    /// `>`, `>=`, `<`, `<=` already emitted, waiting for `?`
    Operand(Token),
}

struct RuleCompiler<'r> {
    rule: &'r str,
    sql: String,
    params: Vec<SqlParam>,
    uses_regex: bool,
    last_field: Option<&'static str>,
    pending: Pending,
    depth: usize,
    seen_tokens: bool,
    /// A clause (or `)`) just closed; only AND, OR or `)` may follow
    clause_done: bool,
}

fn unhandled(token: &Token) -> Error {
    Error::UnhandledToken {
        kind: token.kind,
        text: token.raw.clone(),
        position: token.position,
    }
}

/// Prefix `pattern` with the inline form of `flags`. Rust regex accepts `i`,
/// `m`, `s` and `x` inline; other flags (`g`, `u`, ...) are ignored.
pub(crate) fn with_inline_flags(pattern: &str, flags: &str) -> String {
    let mut inline = String::new();
    for flag in flags.chars() {
        if matches!(flag, 'i' | 'm' | 's' | 'x') && !inline.contains(flag) {
            inline.push(flag);
        }
    }
    if inline.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", inline, pattern)
    }
}

fn regex_param(token: &Token) -> String {
    with_inline_flags(&token.literal, token.regex_flags())
}

impl<'r> RuleCompiler<'r> {
    fn new(rule: &'r str) -> Self {
        RuleCompiler {
            rule,
            sql: String::new(),
            params: Vec::new(),
            uses_regex: false,
            last_field: None,
            pending: Pending::Nothing,
            depth: 0,
            seen_tokens: false,
            clause_done: false,
        }
    }

    fn require_field(&self, token: &Token) -> Result<&'static str> {
        self.last_field.ok_or_else(|| unhandled(token))
    }

    fn require_idle(&self, token: &Token) -> Result<()> {
        match self.pending {
            Pending::Nothing => Ok(()),
            _ => Err(unhandled(token)),
        }
    }

    fn handle_token(&mut self, token: Token) -> Result<()> {
        if token.kind.is_trivia() {
            return Ok(());
        }
        self.seen_tokens = true;

        let joins = matches!(token.kind, TokenKind::And | TokenKind::Or | TokenKind::RParen);
        if joins != self.clause_done {
            return Err(unhandled(&token));
        }

        match token.kind {
            TokenKind::And | TokenKind::Or => {
                self.require_idle(&token)?;
                self.clause_done = false;
                self.sql.push(' ');
                self.sql.push_str(&token.raw.to_uppercase());
                self.sql.push(' ');
            }
            TokenKind::Eq | TokenKind::Neq | TokenKind::StartsWith => {
                self.require_idle(&token)?;
                self.require_field(&token)?;
                self.pending = Pending::Deferred(token);
            }
            TokenKind::Gt | TokenKind::Gte | TokenKind::Lt | TokenKind::Lte => {
                self.require_idle(&token)?;
                let field = self.require_field(&token)?;
                self.sql.push_str(&format!("{} {} ", field, token.raw));
                self.pending = Pending::Operand(token);
            }
            TokenKind::String => self.handle_text_operand(&token)?,
            TokenKind::Number => self.handle_number(&token)?,
            TokenKind::Regex => self.handle_regex(&token)?,
            TokenKind::Field => {
                if matches!(self.pending, Pending::Deferred(_)) {
                    // bare word operand: type = DEP
                    self.handle_text_operand(&token)?;
                } else {
                    self.require_idle(&token)?;
                    self.last_field = Some(validate_rule_field(&token.raw, self.rule)?);
                }
            }
            TokenKind::LParen => {
                self.require_idle(&token)?;
                self.depth += 1;
                self.sql.push('(');
            }
            TokenKind::RParen => {
                self.require_idle(&token)?;
                if self.depth == 0 {
                    return Err(Error::UnbalancedParentheses(self.rule.to_string()));
                }
                self.depth -= 1;
                self.sql.push(')');
            }
            TokenKind::IsBlank | TokenKind::NotIsBlank => {
                self.require_idle(&token)?;
                let f = self.require_field(&token)?;
                if token.kind == TokenKind::NotIsBlank {
                    self.sql.push_str("NOT ");
                }
                self.sql
                    .push_str(&format!("({f} IS NULL OR {f} = '' OR {f} = '[]')"));
                self.clause_done = true;
            }
            TokenKind::Whitespace | TokenKind::Newline => {}
            TokenKind::In | TokenKind::Comma => return Err(unhandled(&token)),
        }

        Ok(())
    }

    fn handle_text_operand(&mut self, token: &Token) -> Result<()> {
        let value = &token.literal;
        match std::mem::replace(&mut self.pending, Pending::Nothing) {
            Pending::Deferred(op) => {
                let field = self.require_field(&op)?;
                let (sql_op, param) = match op.kind {
                    TokenKind::Neq => ("NOT LIKE", format!("%{}%", value)),
                    TokenKind::StartsWith => ("LIKE", format!("{}%", value)),
                    _ => ("LIKE", format!("%{}%", value)),
                };
                self.sql.push_str(&format!("{} {} ?", field, sql_op));
                self.params.push(param.into());
            }
            Pending::Operand(_) => {
                self.sql.push('?');
                self.params.push(value.as_str().into());
            }
            Pending::Nothing => return Err(unhandled(token)),
        }
        self.clause_done = true;
        Ok(())
    }

    fn handle_number(&mut self, token: &Token) -> Result<()> {
        let value = &token.literal;
        match std::mem::replace(&mut self.pending, Pending::Nothing) {
            Pending::Deferred(op) => {
                let field = self.require_field(&op)?;
                match op.kind {
                    TokenKind::Neq => {
                        self.sql.push_str(&format!("{} <> ?", field));
                        self.params.push(value.as_str().into());
                    }
                    TokenKind::StartsWith => {
                        self.sql.push_str(&format!("{} LIKE ?", field));
                        self.params.push(format!("{}%", value).into());
                    }
                    _ => {
                        self.sql.push_str(&format!("{} = ?", field));
                        self.params.push(value.as_str().into());
                    }
                }
            }
            Pending::Operand(_) => {
                self.sql.push('?');
                self.params.push(value.as_str().into());
            }
            Pending::Nothing => return Err(unhandled(token)),
        }
        self.clause_done = true;
        Ok(())
    }

    fn handle_regex(&mut self, token: &Token) -> Result<()> {
        let Pending::Deferred(op) = std::mem::replace(&mut self.pending, Pending::Nothing) else {
            return Err(unhandled(token));
        };
        let field = self.require_field(&op)?;
        let pattern = regex_param(token);
        let (sql_op, param) = match op.kind {
            TokenKind::Neq => ("NOT REGEXP", pattern),
            TokenKind::StartsWith => ("REGEXP", format!("^(?:{})", pattern)),
            _ => ("REGEXP", pattern),
        };
        Regex::new(&param).map_err(|e| Error::InvalidPattern {
            field: field.to_string(),
            pattern: token.raw.clone(),
            reason: e.to_string(),
        })?;
        self.sql.push_str(&format!("{} {} ?", field, sql_op));
        self.params.push(param.into());
        self.uses_regex = true;
        self.clause_done = true;
        Ok(())
    }

    /// `field IN ('a', 'b')` consumes its own parenthesised list
    fn handle_in<I>(&mut self, in_token: &Token, tokens: &mut I) -> Result<()>
    where
        I: Iterator<Item = Result<Token>>,
    {
        self.seen_tokens = true;
        if self.clause_done {
            return Err(unhandled(in_token));
        }
        self.require_idle(in_token)?;
        let field = self.require_field(in_token)?;

        match tokens.next().transpose()? {
            Some(token) if token.kind == TokenKind::LParen => {}
            Some(token) => return Err(unhandled(&token)),
            None => return Err(Error::IncompleteRule(self.rule.to_string())),
        }

        let mut values = Vec::new();
        loop {
            let Some(token) = tokens.next().transpose()? else {
                return Err(Error::IncompleteRule(self.rule.to_string()));
            };
            match token.kind {
                TokenKind::RParen => break,
                TokenKind::Comma => continue,
                TokenKind::String | TokenKind::Number => values.push(token.literal),
                _ => return Err(unhandled(&token)),
            }
        }

        let placeholders = vec!["?"; values.len()].join(", ");
        self.sql
            .push_str(&format!("{} IN ({})", field, placeholders));
        self.params.extend(values.into_iter().map(SqlParam::Text));
        self.clause_done = true;
        Ok(())
    }

    fn finish(self) -> Result<CompiledPredicate> {
        if self.depth != 0 {
            return Err(Error::UnbalancedParentheses(self.rule.to_string()));
        }
        if !self.seen_tokens || !matches!(self.pending, Pending::Nothing) || !self.clause_done {
            return Err(Error::IncompleteRule(self.rule.to_string()));
        }
        debug_assert_eq!(placeholder_count(&self.sql), self.params.len());

        Ok(CompiledPredicate {
            sql: self.sql,
            params: self.params,
            uses_regex: self.uses_regex,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(params: &[SqlParam]) -> Vec<String> {
        params
            .iter()
            .map(|p| match p {
                SqlParam::Text(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_simple_equality_uses_like() {
        let result = compile("description = 'Initial'").unwrap();
        assert_eq!(result.sql, "description LIKE ?");
        assert_eq!(texts(&result.params), vec!["%Initial%"]);
        assert!(!result.uses_regex);
    }

    #[test]
    fn test_bare_word_operand_and_numeric_comparison() {
        let result = compile("type = DEP AND debit > 50").unwrap();
        assert_eq!(result.sql, "type LIKE ? AND debit > ?");
        assert_eq!(texts(&result.params), vec!["%DEP%", "50"]);
    }

    #[test]
    fn test_starts_with_and_inequality() {
        let result = compile("description starts with 'Al'").unwrap();
        assert_eq!(result.sql, "description LIKE ?");
        assert_eq!(texts(&result.params), vec!["Al%"]);

        let result = compile("description <> 'amazon'").unwrap();
        assert_eq!(result.sql, "description NOT LIKE ?");
        assert_eq!(texts(&result.params), vec!["%amazon%"]);
    }

    #[test]
    fn test_escaped_string_literal() {
        let result = compile(r"description = 'ama\'zon'").unwrap();
        assert_eq!(result.sql, "description LIKE ?");
        assert_eq!(texts(&result.params), vec!["%ama'zon%"]);
    }

    #[test]
    fn test_regular_expressions() {
        let result = compile("description = /amaz?n/").unwrap();
        assert_eq!(result.sql, "description REGEXP ?");
        assert_eq!(texts(&result.params), vec!["amaz?n"]);
        assert!(result.uses_regex);

        let result = compile("description <> /prime/i").unwrap();
        assert_eq!(result.sql, "description NOT REGEXP ?");
        assert_eq!(texts(&result.params), vec!["(?i)prime"]);
    }

    #[test]
    fn test_connectives_are_upper_cased_in_source_order() {
        let result = compile("description = 'amazon' or amount <= 20").unwrap();
        assert_eq!(result.sql, "description LIKE ? OR amount <= ?");
        assert_eq!(texts(&result.params), vec!["%amazon%", "20"]);

        let result = compile("type = 'a' or type = 'b' and amount > 1").unwrap();
        assert_eq!(result.sql, "type LIKE ? OR type LIKE ? AND amount > ?");
    }

    #[test]
    fn test_parentheses_and_complex_expressions() {
        let input = "(description = 'amazon' and amount > 30) or (description = /prime/ and amount < 100)";
        let result = compile(input).unwrap();
        assert_eq!(
            result.sql,
            "(description LIKE ? AND amount > ?) OR (description REGEXP ? AND amount < ?)"
        );
        assert_eq!(texts(&result.params), vec!["%amazon%", "30", "prime", "100"]);
    }

    #[test]
    fn test_multiline_nested_expression() {
        let input = "
      (
        (description starts with 'amazon' and description <> 'amazon')
        or
        (description = 'amazon' and amount > 30)
      ) or
      (description = /prime/ and amount < 100)";
        let result = compile(input).unwrap();
        assert_eq!(
            result.sql,
            "((description LIKE ? AND description NOT LIKE ?) OR (description LIKE ? AND amount > ?)) OR (description REGEXP ? AND amount < ?)"
        );
        assert_eq!(
            texts(&result.params),
            vec!["amazon%", "%amazon%", "%amazon%", "30", "prime", "100"]
        );
    }

    #[test]
    fn test_numeric_equality() {
        let result = compile("amount = 50").unwrap();
        assert_eq!(result.sql, "amount = ?");
        let result = compile("amount <> 12.5").unwrap();
        assert_eq!(result.sql, "amount <> ?");
        assert_eq!(texts(&result.params), vec!["12.5"]);
    }

    #[test]
    fn test_is_blank_and_in() {
        let result = compile("description is blank").unwrap();
        assert_eq!(
            result.sql,
            "(description IS NULL OR description = '' OR description = '[]')"
        );
        assert!(result.params.is_empty());

        let result = compile("description not is blank").unwrap();
        assert_eq!(
            result.sql,
            "NOT (description IS NULL OR description = '' OR description = '[]')"
        );

        let result = compile("type IN ('DEP', 'TXN') and amount > 5").unwrap();
        assert_eq!(result.sql, "type IN (?, ?) AND amount > ?");
        assert_eq!(texts(&result.params), vec!["DEP", "TXN", "5"]);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = compile("unallowedField = 'test'").unwrap_err();
        assert!(err.to_string().contains("Field 'unallowedField' is not allowed"));

        let err = compile("secret_column = 'x'").unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[test]
    fn test_invalid_characters_are_lex_errors() {
        let err = compile("@invalidToken = 'test'").unwrap_err();
        assert!(matches!(err, Error::Lex { .. }));
        assert!(err.to_string().contains("invalid syntax at line 1"));
    }

    #[test]
    fn test_unbalanced_parentheses_fail_fast() {
        assert!(matches!(
            compile("(description = 'a'"),
            Err(Error::UnbalancedParentheses(_))
        ));
        assert!(matches!(
            compile("description = 'a')"),
            Err(Error::UnbalancedParentheses(_))
        ));
    }

    #[test]
    fn test_incomplete_and_misplaced_tokens() {
        assert!(matches!(
            compile("description ="),
            Err(Error::IncompleteRule(_))
        ));
        assert!(matches!(compile(""), Err(Error::IncompleteRule(_))));
        assert!(matches!(
            compile("'abc'"),
            Err(Error::UnhandledToken { .. })
        ));
        assert!(matches!(
            compile("description = 'a' , amount > 5"),
            Err(Error::UnhandledToken { .. })
        ));
        assert!(matches!(
            compile("= 'a'"),
            Err(Error::UnhandledToken { .. })
        ));
    }

    #[test]
    fn test_clauses_need_a_connective() {
        assert!(matches!(
            compile("description = 'a' type = 'b'"),
            Err(Error::UnhandledToken { kind: TokenKind::Field, .. })
        ));
        assert!(matches!(
            compile("description = 'a' (type = 'b')"),
            Err(Error::UnhandledToken { kind: TokenKind::LParen, .. })
        ));
        assert!(matches!(
            compile("description is blank amount > 5"),
            Err(Error::UnhandledToken { .. })
        ));
        assert!(matches!(
            compile("and description = 'a'"),
            Err(Error::UnhandledToken { .. })
        ));
        assert!(matches!(
            compile("description = 'a' and"),
            Err(Error::IncompleteRule(_))
        ));
        assert!(matches!(compile("description"), Err(Error::IncompleteRule(_))));
        assert!(matches!(compile("()"), Err(Error::UnhandledToken { .. })));
    }

    #[test]
    fn test_invalid_regex_is_rejected_at_compile() {
        let err = compile("description = /(/").unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
        assert!(err.is_client_error());

        assert!(compile("description starts with /[a-/").is_err());
        assert!(compile("description = /(amazon|prime)/i").is_ok());
    }

    #[test]
    fn test_placeholders_match_params() {
        let rules = [
            "description = 'a'",
            "type = DEP AND debit > 50",
            "(account = '12' or credit >= 3) and description <> /x?y/",
            "description is blank or type IN ('a','b','c')",
            "amount < 10 and amount > 1 and description starts with 'X'",
        ];
        for rule in rules {
            let p = compile(rule).unwrap();
            assert_eq!(placeholder_count(&p.sql), p.params.len(), "rule: {}", rule);
        }
        println!("✅ Placeholder invariant holds for {} rules", rules.len());
    }
}
