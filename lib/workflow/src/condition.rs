//! Condition expressions evaluated against an execution context.
//!
//! The language is intentionally small:
//!
//! - dotted paths into the context (`order.total`, `approved`)
//! - literals: numbers, `"strings"` / `'strings'`, `true`, `false`, `null`
//! - comparisons: `==`, `!=`, `>`, `>=`, `<`, `<=`
//! - boolean operators `!`, `&&`, `||` and parentheses
//!
//! A path that does not resolve evaluates to `null`. A bare operand is
//! interpreted by truthiness: `null`, `false`, `0`, `""` and empty
//! collections are false.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;

/// A condition expression in source form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition(String);

impl Condition {
    /// Wraps an expression.
    #[must_use]
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    /// Returns the expression source.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the expression without evaluating it.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first syntax problem.
    pub fn check(&self) -> Result<(), ConditionError> {
        Parser::new(&self.0)?.parse().map(|_| ())
    }

    /// Evaluates the expression against a scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression cannot be parsed.
    pub fn evaluate(&self, scope: &JsonValue) -> Result<bool, ConditionError> {
        let expr = Parser::new(&self.0)?.parse()?;
        Ok(truthy(&expr.eval(scope)))
    }
}

impl From<&str> for Condition {
    fn from(expression: &str) -> Self {
        Self::new(expression)
    }
}

impl From<String> for Condition {
    fn from(expression: String) -> Self {
        Self(expression)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from parsing a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// The expression is empty.
    Empty,
    /// An unexpected character was found.
    UnexpectedChar { position: usize, found: char },
    /// A string literal was not closed.
    UnterminatedString { position: usize },
    /// The token stream did not match the grammar.
    UnexpectedToken { expected: &'static str, found: String },
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty condition"),
            Self::UnexpectedChar { position, found } => {
                write!(f, "unexpected character '{found}' at {position}")
            }
            Self::UnterminatedString { position } => {
                write!(f, "unterminated string starting at {position}")
            }
            Self::UnexpectedToken { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for ConditionError {}

/// Returns the truthiness of a JSON value.
#[must_use]
pub fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

/// Resolves a dotted path inside a JSON value.
///
/// Numeric segments index into arrays.
#[must_use]
pub fn resolve_path<'a>(scope: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(scope, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Literal(JsonValue),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "'{p}'"),
            Self::Literal(v) => write!(f, "{v}"),
            Self::Op(op) => write!(f, "'{}'", op.symbol()),
            Self::And => write!(f, "'&&'"),
            Self::Or => write!(f, "'||'"),
            Self::Not => write!(f, "'!'"),
            Self::LParen => write!(f, "'('"),
            Self::RParen => write!(f, "')'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    fn apply(self, left: &JsonValue, right: &JsonValue) -> bool {
        match self {
            Self::Eq => values_equal(left, right),
            Self::Ne => !values_equal(left, right),
            Self::Gt => compare(left, right) == Some(Ordering::Greater),
            Self::Ge => matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt => compare(left, right) == Some(Ordering::Less),
            Self::Le => matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

fn values_equal(left: &JsonValue, right: &JsonValue) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::Number(l), JsonValue::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (JsonValue::String(l), JsonValue::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let or_equal = chars.get(i + 1) == Some(&'=');
                let op = match (c, or_equal) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    (_, true) => CompareOp::Le,
                    (_, false) => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if or_equal { 2 } else { 1 };
            }
            '"' | '\'' => {
                let start = i;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString { position: start }),
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(JsonValue::String(text)));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map(JsonValue::from)
                    .or_else(|_| text.parse::<f64>().map(JsonValue::from))
                    .map_err(|_| ConditionError::UnexpectedChar {
                        position: start,
                        found: c,
                    })?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "true" => Token::Literal(JsonValue::Bool(true)),
                    "false" => Token::Literal(JsonValue::Bool(false)),
                    "null" => Token::Literal(JsonValue::Null),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Path(word),
                };
                tokens.push(token);
            }
            other => {
                return Err(ConditionError::UnexpectedChar {
                    position: i,
                    found: other,
                });
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(String),
    Literal(JsonValue),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, scope: &JsonValue) -> JsonValue {
        match self {
            Self::Path(path) => resolve_path(scope, path).cloned().unwrap_or(JsonValue::Null),
            Self::Literal(value) => value.clone(),
            Self::Compare(left, op, right) => {
                JsonValue::Bool(op.apply(&left.eval(scope), &right.eval(scope)))
            }
            Self::Not(inner) => JsonValue::Bool(!truthy(&inner.eval(scope))),
            Self::And(left, right) => {
                JsonValue::Bool(truthy(&left.eval(scope)) && truthy(&right.eval(scope)))
            }
            Self::Or(left, right) => {
                JsonValue::Bool(truthy(&left.eval(scope)) || truthy(&right.eval(scope)))
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        Ok(Self { tokens, pos: 0 })
    }

    fn parse(mut self) -> Result<Expr, ConditionError> {
        let expr = self.or()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(ConditionError::UnexpectedToken {
                expected: "end of expression",
                found: token.to_string(),
            }),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn operand(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Path(path)) => Ok(Expr::Path(path)),
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(ConditionError::UnexpectedToken {
                        expected: "')'",
                        found: other.map_or_else(|| "end of expression".to_string(), |t| t.to_string()),
                    }),
                }
            }
            other => Err(ConditionError::UnexpectedToken {
                expected: "a value or path",
                found: other.map_or_else(|| "end of expression".to_string(), |t| t.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, scope: JsonValue) -> bool {
        Condition::new(expr).evaluate(&scope).expect("valid expression")
    }

    #[test]
    fn numeric_comparisons() {
        assert!(eval("x > 5", json!({"x": 10})));
        assert!(!eval("x > 5", json!({"x": 5})));
        assert!(eval("x >= 5", json!({"x": 5})));
        assert!(eval("x == 2.0", json!({"x": 2})));
        assert!(eval("x < -1", json!({"x": -3})));
    }

    #[test]
    fn string_and_boolean_literals() {
        assert!(eval("status == 'open'", json!({"status": "open"})));
        assert!(eval(r#"status != "closed""#, json!({"status": "open"})));
        assert!(eval("approved == true", json!({"approved": true})));
        assert!(eval("approved", json!({"approved": true})));
        assert!(!eval("approved", json!({"approved": false})));
    }

    #[test]
    fn missing_paths_are_null() {
        assert!(!eval("missing", json!({})));
        assert!(eval("missing == null", json!({})));
        assert!(!eval("missing > 3", json!({})));
    }

    #[test]
    fn nested_paths_and_array_indexes() {
        let scope = json!({"order": {"total": 120, "items": [{"sku": "a"}]}});
        assert!(eval("order.total > 100", scope.clone()));
        assert!(eval("order.items.0.sku == 'a'", scope));
    }

    #[test]
    fn boolean_operators_and_grouping() {
        let scope = json!({"a": 1, "b": 0, "c": true});
        assert!(eval("a && c", scope.clone()));
        assert!(!eval("a && b", scope.clone()));
        assert!(eval("b || c", scope.clone()));
        assert!(eval("!(a && b)", scope.clone()));
        assert!(eval("not b and (a == 1 or b == 1)", scope));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert_eq!(Condition::new("  ").check(), Err(ConditionError::Empty));
        assert!(Condition::new("x >").check().is_err());
        assert!(Condition::new("(x > 1").check().is_err());
        assert!(Condition::new("x # 1").check().is_err());
        assert!(Condition::new("name == 'open").check().is_err());
        assert!(Condition::new("x > 1 y").check().is_err());
    }
}
