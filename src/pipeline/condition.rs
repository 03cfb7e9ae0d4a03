//! Conditions for `wait_for` steps.
//!
//! A condition is parsed once at load time into a [`Condition`] tree. The
//! grammar is small:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")"
//!          | "calling_allowed" "(" operand ")"
//!          | operand ( ( "==" | "!=" ) operand )?
//! operand := path | 'string' | "string" | number | true | false | null
//! ```
//!
//! Conditions may be wrapped in `{{ … }}` as they are in pipeline files.

use serde_json::{Number, Value};

use crate::error::{ExecutorError, StepError};
use crate::pipeline::template::{stringify, Coercion, TemplateError, VarPath};
use crate::scope::Scope;

/// Name of the built-in compliance predicate.
pub const CALLING_ALLOWED: &str = "calling_allowed";

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(VarPath),
    Literal(Value),
}

impl Operand {
    fn value(&self, scope: &Scope) -> Result<Value, StepError> {
        match self {
            Operand::Path(path) => Ok(path.lookup(scope)?.clone()),
            Operand::Literal(value) => Ok(value.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(Operand),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    /// Whether the compliance window is open for the operand's zone.
    CallingAllowed(Operand),
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let text = strip_braces(source.trim());
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(TemplateError::EmptyExpression);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.parse_or()?;
        match parser.peek() {
            None => Ok(condition),
            Some(token) => Err(TemplateError::Syntax(format!(
                "unexpected {} after expression",
                token.describe()
            ))),
        }
    }

    /// Every path the condition reads.
    pub fn references(&self) -> Vec<&VarPath> {
        fn operand_path(operand: &Operand) -> Option<&VarPath> {
            match operand {
                Operand::Path(p) => Some(p),
                Operand::Literal(_) => None,
            }
        }

        match self {
            Condition::Truthy(o) | Condition::CallingAllowed(o) => {
                operand_path(o).into_iter().collect()
            }
            Condition::Compare { left, right, .. } => operand_path(left)
                .into_iter()
                .chain(operand_path(right))
                .collect(),
            Condition::Not(inner) => inner.references(),
            Condition::All(items) | Condition::Any(items) => {
                items.iter().flat_map(|c| c.references()).collect()
            }
        }
    }

    /// Whether the condition consults the compliance window.
    pub fn uses_calling_window(&self) -> bool {
        match self {
            Condition::CallingAllowed(_) => true,
            Condition::Truthy(_) | Condition::Compare { .. } => false,
            Condition::Not(inner) => inner.uses_calling_window(),
            Condition::All(items) | Condition::Any(items) => {
                items.iter().any(Condition::uses_calling_window)
            }
        }
    }

    /// Evaluates the condition against a scope.
    ///
    /// `calling_allowed` answers the compliance predicate for a zone value.
    pub fn evaluate<F>(&self, scope: &Scope, calling_allowed: &F) -> Result<bool, StepError>
    where
        F: Fn(&Value) -> Result<bool, ExecutorError>,
    {
        match self {
            Condition::Truthy(operand) => Ok(is_truthy(&operand.value(scope)?)),
            Condition::Compare { left, op, right } => {
                let equal = loosely_equal(&left.value(scope)?, &right.value(scope)?);
                Ok(match op {
                    CompareOp::Eq => equal,
                    CompareOp::Ne => !equal,
                })
            }
            Condition::CallingAllowed(operand) => Ok(calling_allowed(&operand.value(scope)?)?),
            Condition::Not(inner) => Ok(!inner.evaluate(scope, calling_allowed)?),
            Condition::All(items) => {
                for item in items {
                    if !item.evaluate(scope, calling_allowed)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any(items) => {
                for item in items {
                    if item.evaluate(scope, calling_allowed)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

fn strip_braces(text: &str) -> &str {
    match text.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
        Some(inner) => inner.trim(),
        None => text,
    }
}

/// Null, false, zero and empty strings/collections are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality that lets `'200' == 200` hold.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), other) if !other.is_string() && !other.is_null() => {
            *s == stringify(other, Coercion::Text)
        }
        (other, Value::String(s)) if !other.is_string() && !other.is_null() => {
            *s == stringify(other, Coercion::Text)
        }
        _ => left == right,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    LParen,
    RParen,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{}'", s),
            Token::Str(s) => format!("string '{}'", s),
            Token::Num(n) => format!("number {}", n),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::EqEq => "'=='".to_string(),
            Token::NotEq => "'!='".to_string(),
            Token::AndAnd => "'&&'".to_string(),
            Token::OrOr => "'||'".to_string(),
            Token::Bang => "'!'".to_string(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '=' if next == Some('=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|offset| start + offset)
                    .ok_or_else(|| TemplateError::Syntax("unterminated string".to_string()))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(parse_number(&literal)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '-' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(TemplateError::Syntax(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

fn parse_number(literal: &str) -> Result<Value, TemplateError> {
    let invalid = || TemplateError::Syntax(format!("invalid number '{}'", literal));
    if let Ok(int) = literal.parse::<i64>() {
        return Ok(Value::from(int));
    }
    let float: f64 = literal.parse().map_err(|_| invalid())?;
    Number::from_f64(float).map(Value::Number).ok_or_else(invalid)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), TemplateError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(TemplateError::Syntax(format!(
                "expected {}, found {}",
                expected.describe(),
                token.describe()
            ))),
            None => Err(TemplateError::Syntax(format!(
                "expected {}, found end of expression",
                expected.describe()
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Condition, TemplateError> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(collapse(items, Condition::Any))
    }

    fn parse_and(&mut self) -> Result<Condition, TemplateError> {
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(collapse(items, Condition::All))
    }

    fn parse_unary(&mut self) -> Result<Condition, TemplateError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, TemplateError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }

        if let Some(Token::Ident(name)) = self.peek() {
            if self.tokens.get(self.pos + 1) == Some(&Token::LParen) {
                let name = name.clone();
                if name != CALLING_ALLOWED {
                    return Err(TemplateError::Syntax(format!("unknown function '{}'", name)));
                }
                self.pos += 2;
                let operand = self.parse_operand()?;
                self.expect(Token::RParen)?;
                return Ok(Condition::CallingAllowed(operand));
            }
        }

        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::EqEq) => CompareOp::Eq,
            Some(Token::NotEq) => CompareOp::Ne,
            _ => return Ok(Condition::Truthy(left)),
        };
        self.pos += 1;
        let right = self.parse_operand()?;
        Ok(Condition::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, TemplateError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Operand::Literal(n)),
            Some(Token::Ident(ident)) => Ok(match ident.as_str() {
                "true" => Operand::Literal(Value::Bool(true)),
                "false" => Operand::Literal(Value::Bool(false)),
                "null" => Operand::Literal(Value::Null),
                _ => Operand::Path(VarPath::parse(&ident)?),
            }),
            Some(token) => Err(TemplateError::Syntax(format!(
                "expected a value, found {}",
                token.describe()
            ))),
            None => Err(TemplateError::Syntax(
                "expected a value, found end of expression".to_string(),
            )),
        }
    }
}

fn collapse(mut items: Vec<Condition>, wrap: fn(Vec<Condition>) -> Condition) -> Condition {
    if items.len() == 1 {
        items.remove(0)
    } else {
        wrap(items)
    }
}
