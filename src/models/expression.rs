// Safe expression language for edge conditions and the router agent

//! # Expression Language
//!
//! Edge conditions and the conditional-router agent share one deliberately
//! small expression language: literals, state-field access (dotted paths,
//! with an optional leading `state.` alias), comparison, arithmetic, boolean
//! operators and parentheses. No function calls, no indexing, no reflection.
//!
//! Expressions are parsed once at workflow compile time; evaluation against
//! the execution state is infallible. Accessing a missing field yields null,
//! and any ordering comparison involving null is false, so a malformed state
//! disables a branch instead of failing the execution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("empty expression")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
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
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Dot,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    /// Dotted field path into the state map
    Field(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// A parsed expression, retaining its source for diagnostics and storage
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Expression::parse(&source).map_err(serde::de::Error::custom)
    }
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::UnexpectedToken(format!(
                "{:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Expression {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the execution state
    pub fn evaluate(&self, state: &Map<String, Value>) -> Value {
        eval(&self.root, state)
    }

    /// Evaluate and coerce to a branching decision
    pub fn matches(&self, state: &Map<String, Value>) -> bool {
        truthy(&self.evaluate(state))
    }

    /// Top-level state fields this expression reads (for the compile-time
    /// state-schema closure check)
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        collect_fields(&self.root, &mut fields);
        fields.sort();
        fields.dedup();
        fields
    }
}

fn collect_fields(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Field(path) => {
            if let Some(first) = resolved_path(path).first() {
                out.push(first.clone());
            }
        }
        Expr::Not(inner) | Expr::Neg(inner) => collect_fields(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_fields(lhs, out);
            collect_fields(rhs, out);
        }
        Expr::Literal(_) => {}
    }
}

/// Strip the optional leading `state` alias
fn resolved_path(path: &[String]) -> &[String] {
    if path.len() > 1 && path[0] == "state" {
        &path[1..]
    } else {
        path
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('=', i));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('&', i));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar('|', i));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(ExprError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // a digit followed by ".ident" is a number then a path sep
                    if chars[i] == '.'
                        && chars
                            .get(i + 1)
                            .map(|n| !n.is_ascii_digit())
                            .unwrap_or(true)
                    {
                        break;
                    }
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let value = raw
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedChar(chars[start], start))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
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

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(first)) => {
                let mut path = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(next)) => path.push(next),
                        Some(other) => {
                            return Err(ExprError::UnexpectedToken(format!("{:?}", other)))
                        }
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                Ok(Expr::Field(path))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExprError::UnexpectedToken(format!("{:?}", other))),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExprError::UnexpectedToken(format!("{:?}", other))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

fn number_value(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn eval(expr: &Expr, state: &Map<String, Value>) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Field(path) => {
            let path = resolved_path(path);
            let mut current = match path.first().and_then(|f| state.get(f)) {
                Some(value) => value,
                None => return Value::Null,
            };
            for segment in &path[1..] {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => return Value::Null,
                }
            }
            current.clone()
        }
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, state))),
        Expr::Neg(inner) => match as_number(&eval(inner, state)) {
            Some(n) => number_value(-n),
            None => Value::Null,
        },
        Expr::Binary(op, lhs, rhs) => {
            match op {
                // Short-circuiting boolean operators
                BinaryOp::And => {
                    let left = eval(lhs, state);
                    if !truthy(&left) {
                        return Value::Bool(false);
                    }
                    return Value::Bool(truthy(&eval(rhs, state)));
                }
                BinaryOp::Or => {
                    let left = eval(lhs, state);
                    if truthy(&left) {
                        return Value::Bool(true);
                    }
                    return Value::Bool(truthy(&eval(rhs, state)));
                }
                _ => {}
            }
            let left = eval(lhs, state);
            let right = eval(rhs, state);
            match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    match (as_number(&left), as_number(&right)) {
                        (Some(a), Some(b)) => match op {
                            BinaryOp::Add => number_value(a + b),
                            BinaryOp::Sub => number_value(a - b),
                            BinaryOp::Mul => number_value(a * b),
                            BinaryOp::Div => {
                                if b == 0.0 {
                                    Value::Null
                                } else {
                                    number_value(a / b)
                                }
                            }
                            _ => unreachable!(),
                        },
                        _ => Value::Null,
                    }
                }
                BinaryOp::Eq => Value::Bool(loose_eq(&left, &right)),
                BinaryOp::Ne => Value::Bool(!loose_eq(&left, &right)),
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    Value::Bool(ordering(op, &left, &right))
                }
                BinaryOp::And | BinaryOp::Or => unreachable!(),
            }
        }
    }
}

/// Equality with numeric coercion (1 == 1.0); otherwise deep JSON equality
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

/// Ordering comparison: numbers by value, strings lexicographically,
/// anything else (including null) is false
fn ordering(op: &BinaryOp, left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => false,
        };
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => false,
        };
    }
    false
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn comparison_is_strict() {
        let expr = Expression::parse("state.score > 5").unwrap();
        assert!(expr.matches(&state(&[("score", json!(7))])));
        assert!(!expr.matches(&state(&[("score", json!(5))])));
        assert!(!expr.matches(&state(&[("score", json!(3))])));
    }

    #[test]
    fn missing_field_is_null_and_never_matches_ordering() {
        let expr = Expression::parse("score > 5").unwrap();
        assert!(!expr.matches(&Map::new()));
        let eq = Expression::parse("score == null").unwrap();
        assert!(eq.matches(&Map::new()));
    }

    #[test]
    fn arithmetic_and_precedence() {
        let expr = Expression::parse("1 + 2 * 3 == 7").unwrap();
        assert!(expr.matches(&Map::new()));
        let grouped = Expression::parse("(1 + 2) * 3 == 9").unwrap();
        assert!(grouped.matches(&Map::new()));
        let div = Expression::parse("x / 0").unwrap();
        assert_eq!(div.evaluate(&state(&[("x", json!(4))])), Value::Null);
    }

    #[test]
    fn boolean_operators_short_circuit() {
        let expr = Expression::parse("flag && score > 2 || override").unwrap();
        assert!(expr.matches(&state(&[("flag", json!(true)), ("score", json!(3))])));
        assert!(expr.matches(&state(&[("override", json!(true))])));
        assert!(!expr.matches(&state(&[("flag", json!(false))])));
        let negated = Expression::parse("!(score > 5)").unwrap();
        assert!(negated.matches(&state(&[("score", json!(5))])));
    }

    #[test]
    fn dotted_paths_descend_objects() {
        let expr = Expression::parse("inspection.severity >= 3").unwrap();
        let st = state(&[("inspection", json!({"severity": 4}))]);
        assert!(expr.matches(&st));
    }

    #[test]
    fn string_literals_both_quote_styles() {
        let single = Expression::parse("status == 'approved'").unwrap();
        let double = Expression::parse("status == \"approved\"").unwrap();
        let st = state(&[("status", json!("approved"))]);
        assert!(single.matches(&st));
        assert!(double.matches(&st));
    }

    #[test]
    fn referenced_fields_strip_state_alias() {
        let expr = Expression::parse("state.score > 5 && flag || nested.deep == 1").unwrap();
        assert_eq!(expr.referenced_fields(), vec!["flag", "nested", "score"]);
    }

    #[test]
    fn parse_errors() {
        assert!(Expression::parse("").is_err());
        assert!(Expression::parse("score >").is_err());
        assert!(Expression::parse("score = 5").is_err());
        assert!(Expression::parse("'unterminated").is_err());
        assert!(Expression::parse("a ( b )").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let expr = Expression::parse("score > 5").unwrap();
        let raw = serde_json::to_string(&expr).unwrap();
        assert_eq!(raw, "\"score > 5\"");
        let back: Expression = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, expr);
    }
}
