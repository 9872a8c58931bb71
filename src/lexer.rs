// 🔤 Rule Tokenizer - rule text → typed lexical tokens
// Longest match first on overlapping operators: ">=" before ">", "<=" / "<>" before "<"

use crate::error::{Error, Result};
use std::fmt;
use std::iter::FusedIterator;

// ============================================================================
// POSITION
// ============================================================================

/// Location of a token in the rule text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Byte offset, starting at 0
    pub offset: usize,
    /// Line number, starting at 1
    pub line: usize,
    /// Column number, starting at 1
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

// ============================================================================
// TOKENS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Whitespace,
    Newline,
    Number,
    String,
    Regex,
    LParen,
    RParen,
    And,
    Or,
    Eq,
    Neq,
    Gte,
    Gt,
    Lte,
    Lt,
    StartsWith,
    IsBlank,
    NotIsBlank,
    In,
    Comma,
    Field,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Whitespace => "whitespace",
            TokenKind::Newline => "newline",
            TokenKind::Number => "number",
            TokenKind::String => "string",
            TokenKind::Regex => "regex",
            TokenKind::LParen => "lparen",
            TokenKind::RParen => "rparen",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Eq => "eq",
            TokenKind::Neq => "neq",
            TokenKind::Gte => "gte",
            TokenKind::Gt => "gt",
            TokenKind::Lte => "lte",
            TokenKind::Lt => "lt",
            TokenKind::StartsWith => "startsWith",
            TokenKind::IsBlank => "isblank",
            TokenKind::NotIsBlank => "notisblank",
            TokenKind::In => "in",
            TokenKind::Comma => "comma",
            TokenKind::Field => "field",
        }
    }

    /// Whitespace and newlines carry no meaning for the compiler
    pub fn is_trivia(&self) -> bool {
        matches!(self, TokenKind::Whitespace | TokenKind::Newline)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Unescaped value: string contents without quotes, regex body without delimiters
    pub literal: String,
    /// Exact source text
    pub raw: String,
    pub position: Position,
}

impl Token {
    /// Trailing flags of a regex literal (`/abc/i` → `i`), empty for other kinds
    pub fn regex_flags(&self) -> &str {
        if self.kind != TokenKind::Regex {
            return "";
        }
        self.raw
            .rfind('/')
            .map(|idx| &self.raw[idx + 1..])
            .unwrap_or("")
    }
}

// ============================================================================
// LEXER
// ============================================================================

/// Lazy token stream over a rule string. Ends after the first error.
pub struct Lexer<'a> {
    input: &'a str,
    offset: usize,
    line: usize,
    column: usize,
    failed: bool,
}

/// Tokenize a rule string
pub fn tokenize(input: &str) -> Lexer<'_> {
    Lexer::new(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\r'
}

/// Match a whitespace-separated keyword phrase at the start of `text`.
/// Returns the byte length of the match.
fn keyword_phrase(text: &str, words: &[&str]) -> Option<usize> {
    let mut pos = 0;
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            let gap = text[pos..]
                .find(|c: char| !is_blank(c))
                .unwrap_or(text.len() - pos);
            if gap == 0 {
                return None;
            }
            pos += gap;
        }
        let candidate = text.get(pos..pos + word.len())?;
        if !candidate.eq_ignore_ascii_case(word) {
            return None;
        }
        pos += word.len();
        if text[pos..].chars().next().is_some_and(is_ident_char) {
            return None;
        }
    }
    Some(pos)
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input,
            offset: 0,
            line: 1,
            column: 1,
            failed: false,
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.offset..]
    }

    fn current_position(&self) -> Position {
        Position {
            offset: self.offset,
            line: self.line,
            column: self.column,
        }
    }

    fn advance(&mut self, len: usize) -> &'a str {
        let consumed = &self.input[self.offset..self.offset + len];
        for c in consumed.chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.offset += len;
        consumed
    }

    fn emit(&mut self, kind: TokenKind, len: usize, literal: Option<String>) -> Token {
        let position = self.current_position();
        let raw = self.advance(len).to_string();
        Token {
            kind,
            literal: literal.unwrap_or_else(|| raw.clone()),
            raw,
            position,
        }
    }

    fn error(&self, len: usize) -> Error {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .skip(1)
            .find(|(_, c)| c.is_whitespace())
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len())
            .max(len.min(rest.len()));
        Error::Lex {
            position: self.current_position(),
            found: rest[..end].to_string(),
        }
    }

    fn scan_number(&self) -> usize {
        let rest = self.rest();
        let mut len = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let tail = &rest[len..];
        if let Some(frac) = tail.strip_prefix('.') {
            let digits = frac
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(frac.len());
            if digits > 0 {
                len += 1 + digits;
            }
        }
        len
    }

    /// `'...'` with `\'` and `\\` escapes
    fn scan_string(&self) -> Result<(usize, String)> {
        let rest = self.rest();
        let mut value = String::new();
        let mut chars = rest.char_indices().skip(1);
        while let Some((idx, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, escaped @ ('\'' | '\\'))) => value.push(escaped),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                },
                '\'' => return Ok((idx + 1, value)),
                _ => value.push(c),
            }
        }
        Err(self.error(rest.len()))
    }

    /// `/.../flags` with `\/` escapes
    fn scan_regex(&self) -> Result<(usize, String)> {
        let rest = self.rest();
        let mut body = String::new();
        let mut chars = rest.char_indices().skip(1);
        while let Some((idx, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, '/')) => body.push('/'),
                    Some((_, other)) => {
                        body.push('\\');
                        body.push(other);
                    }
                    None => break,
                },
                '/' => {
                    let after = &rest[idx + 1..];
                    let flags = after
                        .find(|c: char| !c.is_ascii_lowercase())
                        .unwrap_or(after.len());
                    return Ok((idx + 1 + flags, body));
                }
                _ => body.push(c),
            }
        }
        Err(self.error(rest.len()))
    }

    fn scan_word(&self) -> (TokenKind, usize) {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !is_ident_char(c))
            .unwrap_or(rest.len());
        let word = &rest[..len];

        if word.eq_ignore_ascii_case("and") {
            return (TokenKind::And, len);
        }
        if word.eq_ignore_ascii_case("or") {
            return (TokenKind::Or, len);
        }
        if word.eq_ignore_ascii_case("in") {
            return (TokenKind::In, len);
        }
        if word.eq_ignore_ascii_case("notisblank") {
            return (TokenKind::NotIsBlank, len);
        }
        if let Some(n) = keyword_phrase(rest, &["starts", "with"]) {
            return (TokenKind::StartsWith, n);
        }
        if let Some(n) = keyword_phrase(rest, &["is", "blank"]) {
            return (TokenKind::IsBlank, n);
        }
        if let Some(n) = keyword_phrase(rest, &["not", "is", "blank"]) {
            return (TokenKind::NotIsBlank, n);
        }
        (TokenKind::Field, len)
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        let rest = self.rest();
        let Some(c) = rest.chars().next() else {
            return Ok(None);
        };

        let token = match c {
            ' ' | '\t' | '\r' => {
                let len = rest.find(|ch: char| !is_blank(ch)).unwrap_or(rest.len());
                self.emit(TokenKind::Whitespace, len, None)
            }
            '\n' => self.emit(TokenKind::Newline, 1, None),
            '0'..='9' => {
                let len = self.scan_number();
                self.emit(TokenKind::Number, len, None)
            }
            '\'' => {
                let (len, value) = self.scan_string()?;
                self.emit(TokenKind::String, len, Some(value))
            }
            '/' => {
                let (len, body) = self.scan_regex()?;
                self.emit(TokenKind::Regex, len, Some(body))
            }
            '(' => self.emit(TokenKind::LParen, 1, None),
            ')' => self.emit(TokenKind::RParen, 1, None),
            ',' => self.emit(TokenKind::Comma, 1, None),
            '=' => self.emit(TokenKind::Eq, 1, None),
            '<' if rest.starts_with("<>") => self.emit(TokenKind::Neq, 2, None),
            '<' if rest.starts_with("<=") => self.emit(TokenKind::Lte, 2, None),
            '<' => self.emit(TokenKind::Lt, 1, None),
            '>' if rest.starts_with(">=") => self.emit(TokenKind::Gte, 2, None),
            '>' => self.emit(TokenKind::Gt, 1, None),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let (kind, len) = self.scan_word();
                self.emit(kind, len, None)
            }
            _ => return Err(self.error(c.len_utf8())),
        };

        Ok(Some(token))
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_token() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl FusedIterator for Lexer<'_> {}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .map(|t| t.unwrap())
            .filter(|t| !t.kind.is_trivia())
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_longest_match_operators() {
        assert_eq!(
            kinds("amount >= 1 < 2 <= 3 <> 4 > 5 = 6"),
            vec![
                TokenKind::Field,
                TokenKind::Gte,
                TokenKind::Number,
                TokenKind::Lt,
                TokenKind::Number,
                TokenKind::Lte,
                TokenKind::Number,
                TokenKind::Neq,
                TokenKind::Number,
                TokenKind::Gt,
                TokenKind::Number,
                TokenKind::Eq,
                TokenKind::Number,
            ]
        );
    }

    #[test]
    fn test_whitespace_and_newlines_are_emitted() {
        let all: Vec<TokenKind> = tokenize("a =\n 1").map(|t| t.unwrap().kind).collect();
        assert_eq!(
            all,
            vec![
                TokenKind::Field,
                TokenKind::Whitespace,
                TokenKind::Eq,
                TokenKind::Newline,
                TokenKind::Whitespace,
                TokenKind::Number,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens: Vec<Token> = tokenize(r"'ama\'zon \\ x'").map(|t| t.unwrap()).collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].literal, r"ama'zon \ x");
        assert_eq!(tokens[0].raw, r"'ama\'zon \\ x'");
    }

    #[test]
    fn test_regex_literal_with_escaped_slash_and_flags() {
        let tokens: Vec<Token> = tokenize(r"/a\/b+/i").map(|t| t.unwrap()).collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Regex);
        assert_eq!(tokens[0].literal, "a/b+");
        assert_eq!(tokens[0].regex_flags(), "i");
    }

    #[test]
    fn test_keywords_are_whole_words() {
        assert_eq!(
            kinds("android and ORACLE or Description"),
            vec![
                TokenKind::Field,
                TokenKind::And,
                TokenKind::Field,
                TokenKind::Or,
                TokenKind::Field,
            ]
        );
    }

    #[test]
    fn test_phrase_keywords() {
        assert_eq!(
            kinds("description starts  with 'Al'"),
            vec![TokenKind::Field, TokenKind::StartsWith, TokenKind::String]
        );
        assert_eq!(
            kinds("type is blank"),
            vec![TokenKind::Field, TokenKind::IsBlank]
        );
        assert_eq!(
            kinds("type not is blank"),
            vec![TokenKind::Field, TokenKind::NotIsBlank]
        );
        assert_eq!(
            kinds("type IN ('a', 'b')"),
            vec![
                TokenKind::Field,
                TokenKind::In,
                TokenKind::LParen,
                TokenKind::String,
                TokenKind::Comma,
                TokenKind::String,
                TokenKind::RParen,
            ]
        );
        // "starts" alone is just an identifier
        assert_eq!(kinds("starts"), vec![TokenKind::Field]);
    }

    #[test]
    fn test_decimal_numbers() {
        let tokens: Vec<Token> = tokenize("12.50").map(|t| t.unwrap()).collect();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].literal, "12.50");
    }

    #[test]
    fn test_lex_error_reports_position_and_stops() {
        let mut lexer = tokenize("amount > 5\n@invalidToken = 'x'");
        let mut produced = 0;
        let err = loop {
            match lexer.next() {
                Some(Ok(_)) => produced += 1,
                Some(Err(err)) => break err,
                None => panic!("expected a lex error"),
            }
        };
        assert_eq!(produced, 6);
        match err {
            Error::Lex { position, found } => {
                assert_eq!(position.line, 2);
                assert_eq!(position.column, 1);
                assert_eq!(found, "@invalidToken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(lexer.next().is_none());
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        let result: Result<Vec<Token>> = tokenize("description = 'abc").collect();
        assert!(matches!(result, Err(Error::Lex { .. })));
    }
}
