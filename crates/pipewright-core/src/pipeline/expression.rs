//! Restricted expression evaluator for conditions, iterate sources, and
//! `${ ... }` value templates.
//!
//! The grammar is closed: literals (integers, floats, quoted strings,
//! `true`, `false`, `null`), dotted context paths (`context.a.b`, numeric
//! segments index into lists), parentheses, unary minus, and the infix
//! operators `== != < <= > >= + - * / %`. Nothing else is reachable, so an
//! expression can read the context but never run code.
//!
//! Coercion rules:
//! - `+` concatenates when either side is a string, concatenates two lists,
//!   and adds numerically otherwise.
//! - `- * / %` are numeric. Booleans count as 0/1 and numeric strings are
//!   parsed; anything else is a type error.
//! - `/` always yields a float. `%` follows the sign of the divisor.
//! - `< <= > >=` compare two strings lexicographically, otherwise numerically.
//! - `==`/`!=` compare numbers by value (`1 == 1.0`) and everything else
//!   structurally.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

/// Root identifier every path must start with.
pub const CONTEXT_ROOT: &str = "context";

/// Deepest allowed expression tree. Parentheses, unary minus and each
/// operator in a chain add one level.
pub const MAX_NESTING: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error in '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("unknown identifier '{0}' (paths must start with 'context')")]
    UnknownIdentifier(String),

    #[error("missing context key: {0}")]
    MissingKey(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("modulo by zero")]
    ModuloByZero,

    #[error("integer overflow in '{0}'")]
    Overflow(String),

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Path(Vec<String>),
    Op(BinOp),
    LParen,
    RParen,
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn syntax(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            expression: self.source.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                c if c.is_whitespace() => self.pos += 1,
                '(' => {
                    self.pos += 1;
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.pos += 1;
                    tokens.push(Token::RParen);
                }
                '\'' | '"' => tokens.push(self.string(c)?),
                c if c.is_ascii_digit() => tokens.push(self.number()?),
                c if c.is_alphabetic() || c == '_' => tokens.push(self.word()),
                _ => tokens.push(Token::Op(self.operator()?)),
            }
        }
        Ok(tokens)
    }

    fn string(&mut self, quote: char) -> Result<Token, ExpressionError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self
                .peek()
                .ok_or_else(|| self.syntax("unterminated string literal"))?;
            self.pos += 1;
            match c {
                c if c == quote => return Ok(Token::Literal(Value::String(out))),
                '\\' => {
                    let escaped = self
                        .peek()
                        .ok_or_else(|| self.syntax("unterminated escape"))?;
                    self.pos += 1;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                other => out.push(other),
            }
        }
    }

    fn number(&mut self) -> Result<Token, ExpressionError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let value = if is_float {
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        } else {
            text.parse::<i64>().ok().map(Value::from)
        };
        value
            .map(Token::Literal)
            .ok_or_else(|| self.syntax(format!("invalid number '{text}'")))
    }

    fn segment(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn word(&mut self) -> Token {
        let mut segments = vec![self.segment()];
        while self.peek() == Some('.')
            && self
                .peek_at(1)
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
            segments.push(self.segment());
        }
        if segments.len() == 1 {
            match segments[0].as_str() {
                "true" => return Token::Literal(Value::Bool(true)),
                "false" => return Token::Literal(Value::Bool(false)),
                "null" => return Token::Literal(Value::Null),
                _ => {}
            }
        }
        Token::Path(segments)
    }

    fn operator(&mut self) -> Result<BinOp, ExpressionError> {
        let c = self.peek().unwrap_or_default();
        let next = self.peek_at(1);
        let (op, width) = match (c, next) {
            ('=', Some('=')) => (BinOp::Eq, 2),
            ('!', Some('=')) => (BinOp::Ne, 2),
            ('<', Some('=')) => (BinOp::Le, 2),
            ('>', Some('=')) => (BinOp::Ge, 2),
            ('<', _) => (BinOp::Lt, 1),
            ('>', _) => (BinOp::Gt, 1),
            ('+', _) => (BinOp::Add, 1),
            ('-', _) => (BinOp::Sub, 1),
            ('*', _) => (BinOp::Mul, 1),
            ('/', _) => (BinOp::Div, 1),
            ('%', _) => (BinOp::Mod, 1),
            _ => return Err(self.syntax(format!("unexpected character '{c}'"))),
        };
        self.pos += width;
        Ok(op)
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn syntax(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            expression: self.source.to_string(),
            message: message.into(),
        }
    }

    /// Enter one nesting level. Callers restore `depth` once the subtree is
    /// built.
    fn descend(&mut self) -> Result<(), ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(ExpressionError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        Ok(())
    }

    fn peek_op(&self) -> Option<BinOp> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn parse(mut self) -> Result<Expr, ExpressionError> {
        if self.tokens.is_empty() {
            return Err(self.syntax("empty expression"));
        }
        let expr = self.comparison()?;
        if self.pos < self.tokens.len() {
            return Err(self.syntax(format!("unexpected token {:?}", self.tokens[self.pos])));
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let entry = self.depth;
        let mut left = self.additive()?;
        while let Some(op) = self.peek_op().filter(|op| op.is_comparison()) {
            self.pos += 1;
            self.descend()?;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = entry;
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let entry = self.depth;
        let mut left = self.multiplicative()?;
        while let Some(op) = self
            .peek_op()
            .filter(|op| matches!(op, BinOp::Add | BinOp::Sub))
        {
            self.pos += 1;
            self.descend()?;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = entry;
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let entry = self.depth;
        let mut left = self.unary()?;
        while let Some(op) = self
            .peek_op()
            .filter(|op| matches!(op, BinOp::Mul | BinOp::Div | BinOp::Mod))
        {
            self.pos += 1;
            self.descend()?;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = entry;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek_op() == Some(BinOp::Sub) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.syntax("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Literal(value) => Ok(Expr::Literal(value)),
            Token::Path(segments) => {
                if segments[0] != CONTEXT_ROOT {
                    return Err(ExpressionError::UnknownIdentifier(segments.join(".")));
                }
                Ok(Expr::Path(segments))
            }
            Token::LParen => {
                self.descend()?;
                let inner = self.comparison()?;
                self.depth -= 1;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.syntax("expected ')'")),
                }
            }
            Token::RParen => Err(self.syntax("unexpected ')'")),
            Token::Op(op) => Err(self.syntax(format!("unexpected operator '{}'", op.symbol()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn to_num(value: &Value, op: BinOp) -> Result<Num, ExpressionError> {
    match value {
        Value::Number(n) => Ok(match n.as_i64() {
            Some(i) => Num::Int(i),
            None => Num::Float(n.as_f64().unwrap_or(f64::NAN)),
        }),
        Value::Bool(b) => Ok(Num::Int(i64::from(*b))),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .map(Num::Int)
                .or_else(|_| trimmed.parse::<f64>().map(Num::Float))
                .map_err(|_| {
                    ExpressionError::Type(format!(
                        "string '{s}' is not numeric for '{}'",
                        op.symbol()
                    ))
                })
        }
        other => Err(ExpressionError::Type(format!(
            "cannot apply '{}' to {}",
            op.symbol(),
            describe(other)
        ))),
    }
}

fn from_num(num: Num) -> Result<Value, ExpressionError> {
    match num {
        Num::Int(i) => Ok(Value::from(i)),
        Num::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| ExpressionError::Type(format!("non-finite result {f}"))),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness used for conditions: `false`, `null`, zero, and empty
/// strings, lists, and objects are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn lookup(segments: &[String], context: &Map<String, Value>) -> Result<Value, ExpressionError> {
    let missing = || ExpressionError::MissingKey(segments.join("."));
    let Some((first, rest)) = segments[1..].split_first() else {
        return Ok(Value::Object(context.clone()));
    };
    let mut current = context.get(first).ok_or_else(missing)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(missing)?;
    }
    Ok(current.clone())
}

fn arithmetic(op: BinOp, left: Num, right: Num) -> Result<Num, ExpressionError> {
    let overflow = || ExpressionError::Overflow(op.symbol().to_string());
    match op {
        BinOp::Div => {
            let divisor = right.as_f64();
            if divisor == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            Ok(Num::Float(left.as_f64() / divisor))
        }
        BinOp::Mod => match (left, right) {
            (_, Num::Int(0)) => Err(ExpressionError::ModuloByZero),
            (Num::Int(a), Num::Int(b)) => {
                let r = a.checked_rem(b).ok_or_else(overflow)?;
                Ok(Num::Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }))
            }
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                if b == 0.0 {
                    return Err(ExpressionError::ModuloByZero);
                }
                Ok(Num::Float(a - b * (a / b).floor()))
            }
        },
        _ => match (left, right) {
            (Num::Int(a), Num::Int(b)) => {
                let result = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    _ => unreachable!("non-arithmetic operator"),
                };
                result.map(Num::Int).ok_or_else(overflow)
            }
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                Ok(Num::Float(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    _ => unreachable!("non-arithmetic operator"),
                }))
            }
        },
    }
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    if matches!(op, BinOp::Eq | BinOp::Ne) {
        let equal = match (left, right) {
            (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a == b,
                _ => a.as_f64() == b.as_f64(),
            },
            (a, b) => a == b,
        };
        return Ok(if op == BinOp::Eq { equal } else { !equal });
    }

    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (a, b) => {
            let (a, b) = (to_num(a, op)?, to_num(b, op)?);
            match (a, b) {
                (Num::Int(a), Num::Int(b)) => a.cmp(&b),
                (a, b) => a
                    .as_f64()
                    .partial_cmp(&b.as_f64())
                    .ok_or_else(|| ExpressionError::Type("cannot order NaN".to_string()))?,
            }
        }
    };
    Ok(match op {
        BinOp::Lt => ordering == Ordering::Less,
        BinOp::Le => ordering != Ordering::Greater,
        BinOp::Gt => ordering == Ordering::Greater,
        BinOp::Ge => ordering != Ordering::Less,
        _ => unreachable!("non-ordering operator"),
    })
}

fn eval(expr: &Expr, context: &Map<String, Value>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => lookup(segments, context),
        Expr::Neg(inner) => {
            let value = eval(inner, context)?;
            match to_num(&value, BinOp::Sub)? {
                Num::Int(i) => i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| ExpressionError::Overflow("-".to_string())),
                Num::Float(f) => from_num(Num::Float(-f)),
            }
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, context)?;
            let right = eval(right, context)?;
            if op.is_comparison() {
                return compare(*op, &left, &right).map(Value::Bool);
            }
            if *op == BinOp::Add {
                match (&left, &right) {
                    (Value::String(_), _) | (_, Value::String(_)) => {
                        return Ok(Value::String(display(&left) + &display(&right)));
                    }
                    (Value::Array(a), Value::Array(b)) => {
                        return Ok(Value::Array(a.iter().chain(b).cloned().collect()));
                    }
                    _ => {}
                }
            }
            from_num(arithmetic(*op, to_num(&left, *op)?, to_num(&right, *op)?)?)
        }
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates restricted expressions against a live context map.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate an expression to a JSON value.
    pub fn evaluate(
        &self,
        expression: &str,
        context: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        let tokens = Lexer::new(expression).tokenize()?;
        let expr = Parser {
            source: expression,
            tokens,
            pos: 0,
            depth: 0,
        }
        .parse()?;
        eval(&expr, context)
    }

    /// Evaluate an expression and coerce the result with [`is_truthy`].
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &Map<String, Value>,
    ) -> Result<bool, ExpressionError> {
        self.evaluate(expression, context).map(|v| is_truthy(&v))
    }

    /// Resolve `${ expr }` templates anywhere inside a JSON value.
    ///
    /// A string that is exactly one template is replaced by the expression's
    /// value (keeping its type). Other strings, including ones holding
    /// several templates, and scalars are returned unchanged; lists and
    /// objects are resolved element by element.
    pub fn resolve_value(
        &self,
        value: &Value,
        context: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => match template_body(s) {
                Some(body) => self.evaluate(body, context),
                None => Ok(value.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, context)?)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

/// The expression inside `s` when a single `${ ... }` spans all of it.
fn template_body(s: &str) -> Option<&str> {
    let body = s.trim().strip_prefix("${")?;
    let close = closing_brace(body)?;
    (close + 1 == body.len()).then(|| body[..close].trim())
}

/// Byte offset of the first `}` outside a quoted string literal.
fn closing_brace(body: &str) -> Option<usize> {
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '}' => return Some(i),
            None => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
