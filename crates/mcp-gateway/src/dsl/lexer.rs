//! Tokenizer for the template expression language.

use crate::error::{DslError, DslResult};

/// One lexical token with its byte offset into the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

/// Token kinds of the expression grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,

    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
    Dot,
    Comma,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

impl TokenKind {
    /// Human-readable name for parse errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(name) => format!("identifier '{name}'"),
            Self::Number(n) => format!("number {n}"),
            Self::Str(_) => "string literal".to_string(),
            Self::True => "'true'".to_string(),
            Self::False => "'false'".to_string(),
            Self::Null => "'null'".to_string(),
            Self::Plus => "'+'".to_string(),
            Self::Minus => "'-'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::Slash => "'/'".to_string(),
            Self::EqEq => "'=='".to_string(),
            Self::NotEq => "'!='".to_string(),
            Self::Lt => "'<'".to_string(),
            Self::LtEq => "'<='".to_string(),
            Self::Gt => "'>'".to_string(),
            Self::GtEq => "'>='".to_string(),
            Self::AndAnd => "'&&'".to_string(),
            Self::OrOr => "'||'".to_string(),
            Self::Bang => "'!'".to_string(),
            Self::Question => "'?'".to_string(),
            Self::Colon => "':'".to_string(),
            Self::Dot => "'.'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Pipe => "'|'".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::LBracket => "'['".to_string(),
            Self::RBracket => "']'".to_string(),
            Self::LBrace => "'{'".to_string(),
            Self::RBrace => "'}'".to_string(),
        }
    }
}

/// Tokenize a full expression source.
///
/// # Errors
///
/// Returns [`DslError::Parse`] on an unexpected character, an unterminated
/// string, or a malformed number.
pub fn tokenize(src: &str) -> DslResult<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let ch = bytes[pos];

        match ch {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
            }
            b'0'..=b'9' => {
                let (value, next) = lex_number(src, pos)?;
                tokens.push(Token { kind: TokenKind::Number(value), offset: start });
                pos = next;
            }
            b'"' | b'\'' => {
                let (value, next) = lex_string(src, pos)?;
                tokens.push(Token { kind: TokenKind::Str(value), offset: start });
                pos = next;
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let end = ident_end(bytes, pos);
                let word = &src[pos..end];
                let kind = match word {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    _ => TokenKind::Ident(word.to_string()),
                };
                tokens.push(Token { kind, offset: start });
                pos = end;
            }
            b'+' => {
                tokens.push(Token { kind: TokenKind::Plus, offset: start });
                pos += 1;
            }
            b'-' => {
                tokens.push(Token { kind: TokenKind::Minus, offset: start });
                pos += 1;
            }
            b'*' => {
                tokens.push(Token { kind: TokenKind::Star, offset: start });
                pos += 1;
            }
            b'/' => {
                tokens.push(Token { kind: TokenKind::Slash, offset: start });
                pos += 1;
            }
            b'=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::EqEq, offset: start });
                    pos += 2;
                } else {
                    return Err(DslError::parse("expected '==' after '='", start));
                }
            }
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::NotEq, offset: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Bang, offset: start });
                    pos += 1;
                }
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::LtEq, offset: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, offset: start });
                    pos += 1;
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::GtEq, offset: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, offset: start });
                    pos += 1;
                }
            }
            b'&' => {
                if bytes.get(pos + 1) == Some(&b'&') {
                    tokens.push(Token { kind: TokenKind::AndAnd, offset: start });
                    pos += 2;
                } else {
                    return Err(DslError::parse("expected '&&' after '&'", start));
                }
            }
            b'|' => {
                if bytes.get(pos + 1) == Some(&b'|') {
                    tokens.push(Token { kind: TokenKind::OrOr, offset: start });
                    pos += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Pipe, offset: start });
                    pos += 1;
                }
            }
            b'?' => {
                tokens.push(Token { kind: TokenKind::Question, offset: start });
                pos += 1;
            }
            b':' => {
                tokens.push(Token { kind: TokenKind::Colon, offset: start });
                pos += 1;
            }
            b'.' => {
                tokens.push(Token { kind: TokenKind::Dot, offset: start });
                pos += 1;
            }
            b',' => {
                tokens.push(Token { kind: TokenKind::Comma, offset: start });
                pos += 1;
            }
            b'(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset: start });
                pos += 1;
            }
            b')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset: start });
                pos += 1;
            }
            b'[' => {
                tokens.push(Token { kind: TokenKind::LBracket, offset: start });
                pos += 1;
            }
            b']' => {
                tokens.push(Token { kind: TokenKind::RBracket, offset: start });
                pos += 1;
            }
            b'{' => {
                tokens.push(Token { kind: TokenKind::LBrace, offset: start });
                pos += 1;
            }
            b'}' => {
                tokens.push(Token { kind: TokenKind::RBrace, offset: start });
                pos += 1;
            }
            other => {
                return Err(DslError::parse(
                    format!("unexpected character '{}'", other as char),
                    start,
                ));
            }
        }
    }

    Ok(tokens)
}

fn ident_end(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len()
        && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
    {
        pos += 1;
    }
    pos
}

fn lex_number(src: &str, start: usize) -> DslResult<(f64, usize)> {
    let bytes = src.as_bytes();
    let mut pos = start;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)
    {
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    let text = &src[start..pos];
    let value = text
        .parse::<f64>()
        .map_err(|_| DslError::parse(format!("malformed number '{text}'"), start))?;
    Ok((value, pos))
}

fn lex_string(src: &str, start: usize) -> DslResult<(String, usize)> {
    let bytes = src.as_bytes();
    let quote = bytes[start];
    let mut pos = start + 1;
    let mut out = String::new();

    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => {
                let escaped = bytes
                    .get(pos + 1)
                    .ok_or_else(|| DslError::parse("unterminated escape", pos))?;
                let replacement = match escaped {
                    b'n' => '\n',
                    b't' => '\t',
                    b'r' => '\r',
                    b'\\' => '\\',
                    b'"' => '"',
                    b'\'' => '\'',
                    other => {
                        return Err(DslError::parse(
                            format!("unknown escape '\\{}'", *other as char),
                            pos,
                        ));
                    }
                };
                out.push(replacement);
                pos += 2;
            }
            b if b == quote => return Ok((out, pos + 1)),
            _ => {
                // Copy one full UTF-8 scalar.
                let ch = src[pos..].chars().next().expect("in-bounds char boundary");
                out.push(ch);
                pos += ch.len_utf8();
            }
        }
    }

    Err(DslError::parse("unterminated string literal", start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_member_expression() {
        assert_eq!(
            kinds("ctx.user.id"),
            vec![
                TokenKind::Ident("ctx".into()),
                TokenKind::Dot,
                TokenKind::Ident("user".into()),
                TokenKind::Dot,
                TokenKind::Ident("id".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_operators() {
        assert_eq!(
            kinds("a == b && c != d || !e"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::EqEq,
                TokenKind::Ident("b".into()),
                TokenKind::AndAnd,
                TokenKind::Ident("c".into()),
                TokenKind::NotEq,
                TokenKind::Ident("d".into()),
                TokenKind::OrOr,
                TokenKind::Bang,
                TokenKind::Ident("e".into()),
            ]
        );
    }

    #[test]
    fn test_single_pipe_vs_double_pipe() {
        assert_eq!(
            kinds("x | f"),
            vec![TokenKind::Ident("x".into()), TokenKind::Pipe, TokenKind::Ident("f".into())]
        );
    }

    #[test]
    fn test_string_escapes_and_quotes() {
        assert_eq!(kinds(r#""a\nb""#), vec![TokenKind::Str("a\nb".into())]);
        assert_eq!(kinds("'single'"), vec![TokenKind::Str("single".into())]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("3.25"), vec![TokenKind::Number(3.25)]);
        assert_eq!(kinds("42"), vec![TokenKind::Number(42.0)]);
    }

    #[test]
    fn test_unterminated_string_is_parse_error() {
        assert!(matches!(tokenize("\"oops"), Err(DslError::Parse { .. })));
    }

    #[test]
    fn test_lone_ampersand_rejected() {
        assert!(matches!(tokenize("a & b"), Err(DslError::Parse { .. })));
    }

    #[test]
    fn test_keywords() {
        assert_eq!(kinds("true false null"), vec![TokenKind::True, TokenKind::False, TokenKind::Null]);
    }
}
