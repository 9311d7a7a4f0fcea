//! Recursive-descent parser for the template expression language.
//!
//! The AST implements `Display` such that printing an accepted expression
//! and re-parsing the output yields an equivalent tree. Pipes are desugared
//! during parsing: `x | f(a)` parses to the same node as `f(x, a)`.

use std::fmt;

use crate::dsl::lexer::{Token, TokenKind, tokenize};
use crate::dsl::value::format_number;
use crate::error::{DslError, DslResult};

/// Binary operators, grouped by precedence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }

    const fn precedence(self) -> u8 {
        match self {
            Self::Or => 3,
            Self::And => 4,
            Self::Eq | Self::NotEq => 5,
            Self::Lt | Self::LtEq | Self::Gt | Self::GtEq => 6,
            Self::Add | Self::Sub => 7,
            Self::Mul | Self::Div => 8,
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

impl Expr {
    /// Printing precedence: higher binds tighter.
    const fn precedence(&self) -> u8 {
        match self {
            Self::Ternary(..) => 2,
            Self::Binary(op, ..) => op.precedence(),
            Self::Unary(..) => 9,
            _ => 10,
        }
    }
}

/// Parse a complete expression source into an AST.
///
/// # Errors
///
/// Returns [`DslError::Parse`] on lexing failures, unexpected tokens, or
/// trailing input.
pub fn parse(src: &str) -> DslResult<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0, src_len: src.len() };
    let expr = parser.parse_pipe()?;
    if let Some(token) = parser.peek() {
        return Err(DslError::parse(
            format!("unexpected trailing {}", token.kind.describe()),
            token.offset,
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    src_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.src_len, |t| t.offset)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> DslResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            let found = self
                .peek()
                .map_or_else(|| "end of input".to_string(), |t| t.kind.describe());
            Err(DslError::parse(
                format!("expected {}, found {}", kind.describe(), found),
                self.offset(),
            ))
        }
    }

    /// `pipe := ternary ('|' call)*`; each stage desugars into a call with
    /// the accumulated expression prepended to the arguments.
    fn parse_pipe(&mut self) -> DslResult<Expr> {
        let mut expr = self.parse_ternary()?;
        while self.eat(&TokenKind::Pipe) {
            let name = self.expect_ident()?;
            let mut call_args = vec![expr];
            if self.eat(&TokenKind::LParen) {
                if !self.eat(&TokenKind::RParen) {
                    loop {
                        call_args.push(self.parse_ternary()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen)?;
                }
            }
            expr = Expr::Call(name, call_args);
        }
        Ok(expr)
    }

    fn parse_ternary(&mut self) -> DslResult<Expr> {
        let cond = self.parse_binary(0)?;
        if self.eat(&TokenKind::Question) {
            let then_branch = self.parse_ternary()?;
            self.expect(&TokenKind::Colon)?;
            let else_branch = self.parse_ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then_branch),
                Box::new(else_branch),
            ));
        }
        Ok(cond)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> DslResult<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(op) = self.peek_binary_op() {
            if op.precedence() < min_precedence {
                break;
            }
            self.pos += 1;
            let right = self.parse_binary(op.precedence() + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn peek_binary_op(&self) -> Option<BinaryOp> {
        match self.peek_kind()? {
            TokenKind::OrOr => Some(BinaryOp::Or),
            TokenKind::AndAnd => Some(BinaryOp::And),
            TokenKind::EqEq => Some(BinaryOp::Eq),
            TokenKind::NotEq => Some(BinaryOp::NotEq),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::LtEq => Some(BinaryOp::LtEq),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::GtEq => Some(BinaryOp::GtEq),
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            _ => None,
        }
    }

    fn parse_unary(&mut self) -> DslResult<Expr> {
        if self.eat(&TokenKind::Bang) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        if self.eat(&TokenKind::Minus) {
            let operand = self.parse_unary()?;
            // Fold negative literals so `-5` is a number, not a negation.
            if let Expr::Number(n) = operand {
                return Ok(Expr::Number(-n));
            }
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> DslResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.eat(&TokenKind::Dot) {
                let name = self.expect_ident()?;
                expr = Expr::Member(Box::new(expr), name);
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_ternary()?;
                self.expect(&TokenKind::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> DslResult<Expr> {
        let offset = self.offset();
        let Some(token) = self.bump() else {
            return Err(DslError::parse("unexpected end of input", offset));
        };

        match token.kind {
            TokenKind::Null => Ok(Expr::Null),
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    let mut call_args = Vec::new();
                    if !self.eat(&TokenKind::RParen) {
                        loop {
                            call_args.push(self.parse_ternary()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                        self.expect(&TokenKind::RParen)?;
                    }
                    Ok(Expr::Call(name, call_args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            TokenKind::LParen => {
                let inner = self.parse_pipe()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_ternary()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RBracket)?;
                }
                Ok(Expr::Array(items))
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                if !self.eat(&TokenKind::RBrace) {
                    loop {
                        let key = self.expect_object_key()?;
                        self.expect(&TokenKind::Colon)?;
                        let value = self.parse_ternary()?;
                        entries.push((key, value));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RBrace)?;
                }
                Ok(Expr::Object(entries))
            }
            other => Err(DslError::parse(
                format!("unexpected {}", other.describe()),
                token.offset,
            )),
        }
    }

    fn expect_ident(&mut self) -> DslResult<String> {
        let offset = self.offset();
        match self.bump() {
            Some(Token { kind: TokenKind::Ident(name), .. }) => Ok(name),
            Some(token) => Err(DslError::parse(
                format!("expected identifier, found {}", token.kind.describe()),
                token.offset,
            )),
            None => Err(DslError::parse("expected identifier, found end of input", offset)),
        }
    }

    fn expect_object_key(&mut self) -> DslResult<String> {
        let offset = self.offset();
        match self.bump() {
            Some(Token { kind: TokenKind::Ident(name), .. }) => Ok(name),
            Some(Token { kind: TokenKind::Str(s), .. }) => Ok(s),
            Some(token) => Err(DslError::parse(
                format!("expected object key, found {}", token.kind.describe()),
                token.offset,
            )),
            None => Err(DslError::parse("expected object key, found end of input", offset)),
        }
    }
}

fn is_bare_key(key: &str) -> bool {
    !key.is_empty()
        && key.bytes().next().is_some_and(|b| b.is_ascii_alphabetic() || b == b'_')
        && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && !matches!(key, "true" | "false" | "null")
}

fn write_string_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            other => write!(f, "{other}")?,
        }
    }
    f.write_str("\"")
}

/// Write `expr`, parenthesized when its precedence is below `min`.
fn write_with_min(f: &mut fmt::Formatter<'_>, expr: &Expr, min: u8) -> fmt::Result {
    if expr.precedence() < min {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::Str(s) => write_string_literal(f, s),
            Self::Ident(name) => f.write_str(name),
            Self::Member(base, name) => {
                write_with_min(f, base, 10)?;
                write!(f, ".{name}")
            }
            Self::Index(base, index) => {
                write_with_min(f, base, 10)?;
                write!(f, "[{index}]")
            }
            Self::Unary(op, operand) => {
                let symbol = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                };
                f.write_str(symbol)?;
                write_with_min(f, operand, 9)
            }
            Self::Binary(op, left, right) => {
                write_with_min(f, left, op.precedence())?;
                write!(f, " {} ", op.symbol())?;
                write_with_min(f, right, op.precedence() + 1)
            }
            Self::Ternary(cond, then_branch, else_branch) => {
                write_with_min(f, cond, 3)?;
                f.write_str(" ? ")?;
                write_with_min(f, then_branch, 2)?;
                f.write_str(" : ")?;
                write_with_min(f, else_branch, 2)
            }
            Self::Call(name, call_args) => {
                write!(f, "{name}(")?;
                for (i, arg) in call_args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Object(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if is_bare_key(key) {
                        write!(f, "{key}: {value}")?;
                    } else {
                        write_string_literal(f, key)?;
                        write!(f, ": {value}")?;
                    }
                }
                f.write_str("}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(src: &str) {
        let ast = parse(src).unwrap();
        let printed = ast.to_string();
        let reparsed = parse(&printed)
            .unwrap_or_else(|e| panic!("printed form '{printed}' failed to parse: {e}"));
        assert_eq!(ast, reparsed, "printed form '{printed}' parsed differently");
    }

    #[test]
    fn test_parse_member_chain() {
        let ast = parse("ctx.user.id").unwrap();
        assert_eq!(
            ast,
            Expr::Member(
                Box::new(Expr::Member(Box::new(Expr::Ident("ctx".into())), "user".into())),
                "id".into()
            )
        );
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let ast = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            ast,
            Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Binary(
                    BinaryOp::Mul,
                    Box::new(Expr::Number(2.0)),
                    Box::new(Expr::Number(3.0))
                ))
            )
        );
    }

    #[test]
    fn test_parens_override_precedence() {
        let ast = parse("(1 + 2) * 3").unwrap();
        assert!(matches!(ast, Expr::Binary(BinaryOp::Mul, ..)));
    }

    #[test]
    fn test_pipe_desugars_to_call() {
        let piped = parse("x | length").unwrap();
        let direct = parse("length(x)").unwrap();
        assert_eq!(piped, direct);

        let piped = parse("names | join(\", \")").unwrap();
        let direct = parse("join(names, \", \")").unwrap();
        assert_eq!(piped, direct);
    }

    #[test]
    fn test_ternary_right_associative() {
        let ast = parse("a ? b : c ? d : e").unwrap();
        match ast {
            Expr::Ternary(_, _, else_branch) => {
                assert!(matches!(*else_branch, Expr::Ternary(..)));
            }
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn test_object_and_array_literals() {
        let ast = parse("{name: args.name, \"x-tag\": [1, 2]}").unwrap();
        match ast {
            Expr::Object(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, "name");
                assert_eq!(entries[1].0, "x-tag");
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(matches!(parse("1 2"), Err(DslError::Parse { .. })));
    }

    #[test]
    fn test_print_parse_roundtrip() {
        for src in [
            "config.baseUrl + \"/users/\" + toString(user.id)",
            "a ? b : c ? d : e",
            "(1 + 2) * 3 - -4",
            "!(a && b) || c == null",
            "items[0].name",
            "{a: 1, \"b c\": [true, null]}",
            "args.tags | join(\",\") | length",
            "filter(items, item.active) | map(item.name)",
            "default(request.headers[\"x-api-key\"], config.apiKey)",
            "1 <= 2 && 3 > 2",
        ] {
            roundtrip(src);
        }
    }
}
