//! Key Expression Parser
//!
//! Parses the function text stored in a target's `keyFunction` into a small
//! expression tree. Nothing is executed outside this interpreter.
//!
//! # Syntax
//!
//! ```text
//! function [name](payload, topic) { return <expr>; }
//! (payload, topic) => <expr>
//! (payload, topic) => { return <expr>; }
//! payload => <expr>
//! <expr>
//! ```
//!
//! `<expr>` supports literals, identifier paths (`a.b`, `a["b"]`, `a[0]`),
//! parentheses, `+`, `String(<expr>)` and `<expr>.toString()`.

use serde_json::{Number, Value};
use thiserror::Error;

/// Parameter names bound when the text is a bare expression.
pub const DEFAULT_PARAMS: [&str; 2] = ["payload", "topic"];

/// Parse errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
}

/// Result type for parsing
pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    StringLit(String),
    NumberLit(f64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Plus,
    Arrow,
    Semicolon,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "'{}'", name),
            Token::StringLit(s) => write!(f, "string \"{}\"", s),
            Token::NumberLit(n) => write!(f, "number {}", n),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBrace => write!(f, "'{{'"),
            Token::RBrace => write!(f, "'}}'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Dot => write!(f, "'.'"),
            Token::Comma => write!(f, "','"),
            Token::Plus => write!(f, "'+'"),
            Token::Arrow => write!(f, "'=>'"),
            Token::Semicolon => write!(f, "';'"),
        }
    }
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    /// `base.name`
    Member(Box<Expr>, String),
    /// `base[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `left + right`
    Add(Box<Expr>, Box<Expr>),
    /// `String(x)` or `x.toString()`
    Stringify(Box<Expr>),
}

/// A parsed key function: parameter names and the returned expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFunction {
    pub params: Vec<String>,
    pub body: Expr,
}

/// Parse function text.
pub fn parse_function(input: &str) -> ParseResult<ParsedFunction> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::UnexpectedEnd);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let function = parser.parse_function()?;
    parser.expect_end()?;
    Ok(function)
}

fn tokenize(input: &str) -> ParseResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semicolon);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Arrow);
                } else {
                    return Err(ParseError::InvalidSyntax(
                        "assignment is not allowed".to_string(),
                    ));
                }
            }
            '"' | '\'' | '`' => {
                let quote = ch;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => break,
                        },
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        '$' if quote == '`' && chars.peek() == Some(&'{') => {
                            return Err(ParseError::InvalidSyntax(
                                "template interpolation is not supported".to_string(),
                            ));
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(ParseError::UnexpectedEnd);
                }
                tokens.push(Token::StringLit(value));
            }
            c if c.is_ascii_digit() => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| ParseError::InvalidSyntax(format!("bad number '{}'", literal)))?;
                tokens.push(Token::NumberLit(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '$' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ParseError::InvalidSyntax(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> ParseResult<Token> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> ParseResult<()> {
        let found = self.advance()?;
        if found == expected {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: found.to_string(),
            })
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        match self.advance()? {
            Token::Ident(name) if name == keyword => Ok(()),
            other => Err(ParseError::UnexpectedToken {
                expected: format!("'{}'", keyword),
                found: other.to_string(),
            }),
        }
    }

    fn expect_ident(&mut self) -> ParseResult<String> {
        match self.advance()? {
            Token::Ident(name) => Ok(name),
            other => Err(ParseError::UnexpectedToken {
                expected: "identifier".to_string(),
                found: other.to_string(),
            }),
        }
    }

    fn expect_end(&self) -> ParseResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ParseError::UnexpectedToken {
                expected: "end of input".to_string(),
                found: token.to_string(),
            }),
        }
    }

    fn parse_function(&mut self) -> ParseResult<ParsedFunction> {
        if matches!(self.peek(), Some(Token::Ident(k)) if k == "function") {
            self.advance()?;
            if matches!(self.peek(), Some(Token::Ident(_))) {
                self.advance()?;
            }
            let params = self.parse_params()?;
            let body = self.parse_block()?;
            return Ok(ParsedFunction { params, body });
        }

        if self.is_arrow_with_parens() {
            let params = self.parse_params()?;
            self.expect(Token::Arrow)?;
            let body = self.parse_arrow_body()?;
            return Ok(ParsedFunction { params, body });
        }

        if matches!(self.peek(), Some(Token::Ident(_))) && self.peek_at(1) == Some(&Token::Arrow) {
            let param = self.expect_ident()?;
            self.expect(Token::Arrow)?;
            let body = self.parse_arrow_body()?;
            return Ok(ParsedFunction {
                params: vec![param],
                body,
            });
        }

        let body = self.parse_expression()?;
        if self.peek() == Some(&Token::Semicolon) {
            self.advance()?;
        }
        Ok(ParsedFunction {
            params: DEFAULT_PARAMS.iter().map(|p| p.to_string()).collect(),
            body,
        })
    }

    /// `( ... ) =>` at the current position.
    fn is_arrow_with_parens(&self) -> bool {
        if self.peek() != Some(&Token::LParen) {
            return false;
        }
        let mut offset = 1;
        while let Some(token) = self.peek_at(offset) {
            match token {
                Token::Ident(_) | Token::Comma => offset += 1,
                Token::RParen => return self.peek_at(offset + 1) == Some(&Token::Arrow),
                _ => return false,
            }
        }
        false
    }

    fn parse_params(&mut self) -> ParseResult<Vec<String>> {
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance()?;
            return Ok(params);
        }
        loop {
            params.push(self.expect_ident()?);
            match self.advance()? {
                Token::Comma => continue,
                Token::RParen => break,
                other => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "',' or ')'".to_string(),
                        found: other.to_string(),
                    })
                }
            }
        }
        Ok(params)
    }

    fn parse_arrow_body(&mut self) -> ParseResult<Expr> {
        if self.peek() == Some(&Token::LBrace) {
            self.parse_block()
        } else {
            self.parse_expression()
        }
    }

    /// `{ return <expr>; }`
    fn parse_block(&mut self) -> ParseResult<Expr> {
        self.expect(Token::LBrace)?;
        self.expect_keyword("return")?;
        let body = self.parse_expression()?;
        if self.peek() == Some(&Token::Semicolon) {
            self.advance()?;
        }
        self.expect(Token::RBrace)?;
        Ok(body)
    }

    fn parse_expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_postfix()?;
        while self.peek() == Some(&Token::Plus) {
            self.advance()?;
            let right = self.parse_postfix()?;
            left = Expr::Add(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance()?;
                    let name = self.expect_ident()?;
                    if self.peek() == Some(&Token::LParen) {
                        if name != "toString" {
                            return Err(ParseError::UnknownFunction(name));
                        }
                        self.expect(Token::LParen)?;
                        self.expect(Token::RParen)?;
                        expr = Expr::Stringify(Box::new(expr));
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.advance()?;
                    let index = self.parse_expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.advance()? {
            Token::StringLit(s) => Ok(Expr::Literal(Value::String(s))),
            Token::NumberLit(n) => Ok(Expr::Literal(number_value(n))),
            Token::LParen => {
                let inner = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                "String" if self.peek() == Some(&Token::LParen) => {
                    self.advance()?;
                    let inner = self.parse_expression()?;
                    self.expect(Token::RParen)?;
                    Ok(Expr::Stringify(Box::new(inner)))
                }
                _ if self.peek() == Some(&Token::LParen) => Err(ParseError::UnknownFunction(name)),
                _ => Ok(Expr::Variable(name)),
            },
            other => Err(ParseError::UnexpectedToken {
                expected: "expression".to_string(),
                found: other.to_string(),
            }),
        }
    }
}

/// Integral values stay integers so they print without a fraction.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn path(root: &str, fields: &[&str]) -> Expr {
        fields.iter().fold(Expr::Variable(root.to_string()), |acc, f| {
            Expr::Member(Box::new(acc), f.to_string())
        })
    }

    #[test]
    fn test_function_declaration() {
        let parsed =
            parse_function("function (payload, topic) { return payload.device.id; }").unwrap();
        assert_eq!(parsed.params, vec!["payload", "topic"]);
        assert_eq!(parsed.body, path("payload", &["device", "id"]));
    }

    #[test]
    fn test_named_function_without_semicolon() {
        let parsed = parse_function("function key(m) { return m.id }").unwrap();
        assert_eq!(parsed.params, vec!["m"]);
        assert_eq!(parsed.body, path("m", &["id"]));
    }

    #[test]
    fn test_arrow_forms() {
        let single = parse_function("m => m.id").unwrap();
        assert_eq!(single.params, vec!["m"]);

        let pair = parse_function("(m, t) => t + '-' + m.id").unwrap();
        assert_eq!(pair.params, vec!["m", "t"]);
        assert!(matches!(pair.body, Expr::Add(_, _)));

        let block = parse_function("(m) => { return m['id']; }").unwrap();
        assert_eq!(
            block.body,
            Expr::Index(
                Box::new(Expr::Variable("m".into())),
                Box::new(Expr::Literal(Value::String("id".into())))
            )
        );
    }

    #[test]
    fn test_bare_expression_uses_default_params() {
        let parsed = parse_function("String(payload.id)").unwrap();
        assert_eq!(parsed.params, vec!["payload", "topic"]);
        assert_eq!(parsed.body, Expr::Stringify(Box::new(path("payload", &["id"]))));
    }

    #[test]
    fn test_parenthesized_expression_is_not_an_arrow() {
        let parsed = parse_function("(payload.a + payload.b)").unwrap();
        assert!(matches!(parsed.body, Expr::Add(_, _)));
    }

    #[test]
    fn test_rejects_calls_and_assignment() {
        assert_eq!(
            parse_function("m => require('fs')"),
            Err(ParseError::UnknownFunction("require".into()))
        );
        assert_eq!(
            parse_function("m => m.constructor()"),
            Err(ParseError::UnknownFunction("constructor".into()))
        );
        assert!(parse_function("m => m.id = 1").is_err());
        assert!(parse_function("m => `${m.id}`").is_err());
    }

    #[test]
    fn test_trailing_tokens_are_errors() {
        assert!(matches!(
            parse_function("payload.id topic"),
            Err(ParseError::UnexpectedToken { .. })
        ));
        assert_eq!(parse_function("   "), Err(ParseError::UnexpectedEnd));
    }

    #[test]
    fn test_number_literals() {
        assert_eq!(number_value(3.0), Value::from(3));
        assert_eq!(number_value(1.5), Value::from(1.5));
    }
}
