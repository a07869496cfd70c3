//! Single-pass character-cursor lexer.
//!
//! Tracks `(line, column, byte_offset)` as it walks the source. Whitespace
//! and `; ...` line comments are skipped. Unknown characters become an
//! `Invalid` token rather than aborting the scan — a full pipeline surfaces
//! those as diagnostics instead of panicking mid-lex.

use serde::{Deserialize, Serialize};

/// A position in source text: 1-based line/column, 0-based byte offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Pipe,
    Question,
    Arrow,
    Identifier(String),
    Number(String),
    String(String),
    Boolean(bool),
    VersionMarker(String),
    KeywordMarker(String),
    Eof,
    /// Unknown single character; surfaced as a diagnostic by a full pipeline.
    Invalid(char),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated string literal starting at line {line}, column {column}")]
    UnterminatedString { line: u32, column: u32 },
}

struct Cursor<'a> {
    source: &'a str,
    bytes: &'a [u8],
    offset: usize,
    line: u32,
    column: u32,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    fn pos(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
            offset: self.offset,
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.offset..].chars().next()
    }

    fn peek_at(&self, skip: usize) -> Option<char> {
        self.source[self.offset..].chars().nth(skip)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn at_eof(&self) -> bool {
        self.offset >= self.bytes.len()
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Tokenize source text, including `Invalid` tokens for unrecognized
/// characters. Errors are returned only for conditions the cursor cannot
/// recover from locally (unterminated strings).
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();

    loop {
        skip_whitespace_and_comments(&mut cursor);
        let start = cursor.pos();
        let Some(c) = cursor.peek() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                start,
                end: start,
            });
            break;
        };

        let kind = match c {
            '(' => {
                cursor.bump();
                TokenKind::LParen
            }
            ')' => {
                cursor.bump();
                TokenKind::RParen
            }
            '[' => {
                cursor.bump();
                TokenKind::LBracket
            }
            ']' => {
                cursor.bump();
                TokenKind::RBracket
            }
            '{' => {
                cursor.bump();
                TokenKind::LBrace
            }
            '}' => {
                cursor.bump();
                TokenKind::RBrace
            }
            ',' => {
                cursor.bump();
                TokenKind::Comma
            }
            '.' => {
                cursor.bump();
                TokenKind::Dot
            }
            '|' => {
                cursor.bump();
                TokenKind::Pipe
            }
            '?' => {
                cursor.bump();
                TokenKind::Question
            }
            '-' if cursor.peek_at(1).map(|n| n.is_ascii_digit()).unwrap_or(false) => {
                lex_number(&mut cursor)
            }
            '-' if cursor.peek_at(1) == Some('>') => {
                cursor.bump();
                cursor.bump();
                TokenKind::Arrow
            }
            c if c.is_ascii_digit() => lex_number(&mut cursor),
            '"' => lex_string(&mut cursor, start)?,
            ':' => lex_colon(&mut cursor),
            // Arithmetic/comparison operator symbols used as call-head
            // targets in prefix expressions, e.g. `(+ a b)`, `(> x 10)`.
            // Not part of the structural-delimiter set in the token
            // grammar, but the worked examples require them to tokenize
            // as ordinary call targets, so they are lexed as identifiers.
            '+' | '*' | '/' | '%' | '=' => {
                cursor.bump();
                TokenKind::Identifier(c.to_string())
            }
            '!' if cursor.peek_at(1) == Some('=') => {
                cursor.bump();
                cursor.bump();
                TokenKind::Identifier("!=".to_string())
            }
            '<' | '>' => {
                cursor.bump();
                if cursor.peek() == Some('=') {
                    cursor.bump();
                    TokenKind::Identifier(format!("{}=", c))
                } else {
                    TokenKind::Identifier(c.to_string())
                }
            }
            c if is_ident_start(c) || c == '-' => lex_identifier_or_keyword(&mut cursor),
            other => {
                cursor.bump();
                TokenKind::Invalid(other)
            }
        };

        let end = cursor.pos();
        tokens.push(Token { kind, start, end });
    }

    Ok(tokens)
}

/// Tokenize, dropping `Invalid` tokens. Convenience wrapper for callers that
/// don't need to surface lex-level diagnostics.
pub fn tokenize_lossy(source: &str) -> Result<Vec<Token>, LexError> {
    Ok(tokenize(source)?
        .into_iter()
        .filter(|t| !matches!(t.kind, TokenKind::Invalid(_)))
        .collect())
}

fn skip_whitespace_and_comments(cursor: &mut Cursor) {
    loop {
        match cursor.peek() {
            Some(c) if c.is_whitespace() => {
                cursor.bump();
            }
            Some(';') => {
                while let Some(c) = cursor.peek() {
                    if c == '\n' {
                        break;
                    }
                    cursor.bump();
                }
            }
            _ => break,
        }
    }
}

fn lex_number(cursor: &mut Cursor) -> TokenKind {
    let start_offset = cursor.offset;
    if cursor.peek() == Some('-') {
        cursor.bump();
    }
    while cursor.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        cursor.bump();
    }
    if cursor.peek() == Some('.') && cursor.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false)
    {
        cursor.bump();
        while cursor.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            cursor.bump();
        }
    }
    TokenKind::Number(cursor.source[start_offset..cursor.offset].to_string())
}

fn lex_string(cursor: &mut Cursor, start: Position) -> Result<TokenKind, LexError> {
    let start_offset = cursor.offset;
    cursor.bump(); // opening quote
    loop {
        match cursor.peek() {
            None => {
                return Err(LexError::UnterminatedString {
                    line: start.line,
                    column: start.column,
                })
            }
            Some('\\') => {
                cursor.bump();
                if cursor.peek().is_some() {
                    cursor.bump();
                }
            }
            Some('"') => {
                cursor.bump();
                break;
            }
            Some(_) => {
                cursor.bump();
            }
        }
    }
    Ok(TokenKind::String(
        cursor.source[start_offset..cursor.offset].to_string(),
    ))
}

fn lex_colon(cursor: &mut Cursor) -> TokenKind {
    cursor.bump(); // ':'
    let is_version = cursor.peek() == Some('v')
        && cursor
            .peek_at(1)
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false);
    let start_offset = cursor.offset;
    if is_version {
        cursor.bump(); // 'v'
        while cursor
            .peek()
            .map(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c.is_ascii_alphanumeric())
            .unwrap_or(false)
        {
            cursor.bump();
        }
        TokenKind::VersionMarker(cursor.source[start_offset..cursor.offset].to_string())
    } else {
        while cursor.peek().map(is_ident_continue).unwrap_or(false) {
            cursor.bump();
        }
        TokenKind::KeywordMarker(cursor.source[start_offset..cursor.offset].to_string())
    }
}

fn lex_identifier_or_keyword(cursor: &mut Cursor) -> TokenKind {
    let start_offset = cursor.offset;
    cursor.bump();
    while cursor.peek().map(is_ident_continue).unwrap_or(false) {
        cursor.bump();
    }
    let text = &cursor.source[start_offset..cursor.offset];
    match text {
        "true" => TokenKind::Boolean(true),
        "false" => TokenKind::Boolean(false),
        _ => TokenKind::Identifier(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize_lossy(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| *k != TokenKind::Eof)
            .collect()
    }

    #[test]
    fn lexes_structural_tokens() {
        assert_eq!(
            kinds("()[]{}"),
            vec![
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBracket,
                TokenKind::RBracket,
                TokenKind::LBrace,
                TokenKind::RBrace,
            ]
        );
    }

    #[test]
    fn lexes_identifiers_with_dash_and_underscore() {
        assert_eq!(
            kinds("get-answer do_thing"),
            vec![
                TokenKind::Identifier("get-answer".into()),
                TokenKind::Identifier("do_thing".into()),
            ]
        );
    }

    #[test]
    fn leading_minus_only_consumed_before_digit() {
        assert_eq!(kinds("-5"), vec![TokenKind::Number("-5".into())]);
        assert_eq!(kinds("-abc"), vec![TokenKind::Identifier("-abc".into())]);
    }

    #[test]
    fn lexes_decimal_number() {
        assert_eq!(kinds("3.14"), vec![TokenKind::Number("3.14".into())]);
    }

    #[test]
    fn lexes_version_marker() {
        assert_eq!(
            kinds(":v1.2.3-beta+build"),
            vec![TokenKind::VersionMarker("v1.2.3-beta+build".into())]
        );
    }

    #[test]
    fn lexes_keyword_marker() {
        assert_eq!(
            kinds(":inputs"),
            vec![TokenKind::KeywordMarker("inputs".into())]
        );
    }

    #[test]
    fn lexes_boolean_literals() {
        assert_eq!(
            kinds("true false"),
            vec![TokenKind::Boolean(true), TokenKind::Boolean(false)]
        );
    }

    #[test]
    fn retains_quotes_and_raw_escapes_in_string_text() {
        assert_eq!(
            kinds(r#""say \"hi\"""#),
            vec![TokenKind::String("\"say \\\"hi\\\"\"".into())]
        );
    }

    #[test]
    fn skips_line_comments() {
        assert_eq!(
            kinds("(fn ; a comment\n foo)"),
            vec![
                TokenKind::LParen,
                TokenKind::Identifier("fn".into()),
                TokenKind::Identifier("foo".into()),
                TokenKind::RParen,
            ]
        );
    }

    #[test]
    fn lexes_operator_symbols_as_identifiers() {
        assert_eq!(
            kinds("+ >= <"),
            vec![
                TokenKind::Identifier("+".into()),
                TokenKind::Identifier(">=".into()),
                TokenKind::Identifier("<".into()),
            ]
        );
    }

    #[test]
    fn unknown_character_yields_invalid_token() {
        let tokens = tokenize("@").unwrap();
        assert!(matches!(tokens[0].kind, TokenKind::Invalid('@')));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("\"abc").unwrap_err();
        assert_eq!(
            err,
            LexError::UnterminatedString {
                line: 1,
                column: 1
            }
        );
    }

    #[test]
    fn tracks_line_and_column_across_newlines() {
        let tokens = tokenize_lossy("a\nb").unwrap();
        assert_eq!(tokens[0].start, Position { line: 1, column: 1, offset: 0 });
        assert_eq!(tokens[1].start, Position { line: 2, column: 1, offset: 2 });
    }
}
