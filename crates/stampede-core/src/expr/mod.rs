//! Embedded expression evaluator.
//!
//! Replaces dynamic script evaluation for step conditions, loop
//! `while`/`until` predicates, custom checks/extracts, and hook bodies.
//! Supports identifier lookup (dot-paths resolved by the caller),
//! comparisons, boolean operators, arithmetic, and calls against a
//! whitelisted helpers table.

use serde_json::Value;

use crate::error::StampedeError;

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Or,
    And,
    Not,
    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, StampedeError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
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
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(StampedeError::Expression(format!(
                        "unexpected '=' at offset {i}; use '==' for comparison"
                    )));
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
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Gte);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Lte);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(StampedeError::Expression(format!(
                        "unexpected '&' at offset {i}"
                    )));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(StampedeError::Expression(format!(
                        "unexpected '|' at offset {i}"
                    )));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(StampedeError::Expression(
                        "unterminated string literal".to_string(),
                    ));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    s.push(chars[i]);
                    i += 1;
                }
                let n: f64 = s.parse().map_err(|_| {
                    StampedeError::Expression(format!("invalid number literal \"{s}\""))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut s = String::new();
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '.'
                        || chars[i] == '$')
                {
                    s.push(chars[i]);
                    i += 1;
                }
                match s.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => {
                return Err(StampedeError::Expression(format!(
                    "unexpected character '{other}' at offset {i}"
                )))
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST & parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
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
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<(), StampedeError> {
        match self.advance() {
            Some(t) if t == token => Ok(()),
            other => Err(StampedeError::Expression(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, StampedeError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, StampedeError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, StampedeError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Neq,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, StampedeError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Gte) => BinaryOp::Gte,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Lte) => BinaryOp::Lte,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, StampedeError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, StampedeError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, StampedeError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, StampedeError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.advance();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(StampedeError::Expression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(serde_json::Number::from(n as i64))
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// True if the value counts as truthy in a condition.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    a == b
}

fn eval(
    expr: &Expr,
    resolver: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value, StampedeError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        // Unknown identifiers resolve to null so conditions over absent
        // variables are false rather than fatal.
        Expr::Var(name) => Ok(resolver(name).unwrap_or(Value::Null)),
        Expr::Unary(op, inner) => {
            let v = eval(inner, resolver)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => {
                    let n = as_number(&v).ok_or_else(|| {
                        StampedeError::Expression("cannot negate a non-number".to_string())
                    })?;
                    Ok(number_value(-n))
                }
            }
        }
        Expr::Binary(op, lhs, rhs) => match op {
            BinaryOp::Or => {
                let l = eval(lhs, resolver)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&eval(rhs, resolver)?)))
            }
            BinaryOp::And => {
                let l = eval(lhs, resolver)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&eval(rhs, resolver)?)))
            }
            BinaryOp::Eq => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                Ok(Value::Bool(values_equal(&l, &r)))
            }
            BinaryOp::Neq => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                Ok(Value::Bool(!values_equal(&l, &r)))
            }
            BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                // String comparison when neither side is numeric.
                if let (Some(x), Some(y)) = (as_number(&l), as_number(&r)) {
                    let pass = match op {
                        BinaryOp::Gt => x > y,
                        BinaryOp::Gte => x >= y,
                        BinaryOp::Lt => x < y,
                        BinaryOp::Lte => x <= y,
                        _ => unreachable!(),
                    };
                    return Ok(Value::Bool(pass));
                }
                if let (Value::String(a), Value::String(b)) = (&l, &r) {
                    let pass = match op {
                        BinaryOp::Gt => a > b,
                        BinaryOp::Gte => a >= b,
                        BinaryOp::Lt => a < b,
                        BinaryOp::Lte => a <= b,
                        _ => unreachable!(),
                    };
                    return Ok(Value::Bool(pass));
                }
                Err(StampedeError::Expression(format!(
                    "cannot compare {l:?} with {r:?}"
                )))
            }
            BinaryOp::Add => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                // String concatenation when either side is a string.
                if let (Value::String(_), _) | (_, Value::String(_)) = (&l, &r) {
                    return Ok(Value::String(format!(
                        "{}{}",
                        value_to_string(&l),
                        value_to_string(&r)
                    )));
                }
                arith(&l, &r, |x, y| x + y)
            }
            BinaryOp::Sub => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                arith(&l, &r, |x, y| x - y)
            }
            BinaryOp::Mul => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                arith(&l, &r, |x, y| x * y)
            }
            BinaryOp::Div => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                let y = as_number(&r);
                if y == Some(0.0) {
                    return Err(StampedeError::Expression("division by zero".to_string()));
                }
                arith(&l, &r, |x, y| x / y)
            }
            BinaryOp::Rem => {
                let (l, r) = (eval(lhs, resolver)?, eval(rhs, resolver)?);
                let y = as_number(&r);
                if y == Some(0.0) {
                    return Err(StampedeError::Expression("division by zero".to_string()));
                }
                arith(&l, &r, |x, y| x % y)
            }
        },
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(a, resolver)?);
            }
            call_helper(name, &values)
        }
    }
}

fn arith(l: &Value, r: &Value, op: impl Fn(f64, f64) -> f64) -> Result<Value, StampedeError> {
    match (as_number(l), as_number(r)) {
        (Some(x), Some(y)) => Ok(number_value(op(x, y))),
        _ => Err(StampedeError::Expression(format!(
            "arithmetic on non-numbers: {l:?}, {r:?}"
        ))),
    }
}

/// Render a value the way templating does: bare strings, JSON otherwise.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn call_helper(name: &str, args: &[Value]) -> Result<Value, StampedeError> {
    let arg = |i: usize| -> Result<&Value, StampedeError> {
        args.get(i).ok_or_else(|| {
            StampedeError::Expression(format!("{name}() is missing argument {i}"))
        })
    };

    match name {
        "len" => {
            let v = arg(0)?;
            let n = match v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => {
                    return Err(StampedeError::Expression(
                        "len() expects a string, array, or object".to_string(),
                    ))
                }
            };
            Ok(number_value(n as f64))
        }
        "contains" => Ok(Value::Bool(
            value_to_string(arg(0)?).contains(&value_to_string(arg(1)?)),
        )),
        "starts_with" => Ok(Value::Bool(
            value_to_string(arg(0)?).starts_with(&value_to_string(arg(1)?)),
        )),
        "ends_with" => Ok(Value::Bool(
            value_to_string(arg(0)?).ends_with(&value_to_string(arg(1)?)),
        )),
        "matches" => {
            let re = regex::Regex::new(&value_to_string(arg(1)?)).map_err(|e| {
                StampedeError::Expression(format!("matches(): invalid pattern: {e}"))
            })?;
            Ok(Value::Bool(re.is_match(&value_to_string(arg(0)?))))
        }
        "number" => {
            let n = as_number(arg(0)?).ok_or_else(|| {
                StampedeError::Expression("number(): not convertible".to_string())
            })?;
            Ok(number_value(n))
        }
        "string" => Ok(Value::String(value_to_string(arg(0)?))),
        "abs" => {
            let n = as_number(arg(0)?).ok_or_else(|| {
                StampedeError::Expression("abs() expects a number".to_string())
            })?;
            Ok(number_value(n.abs()))
        }
        "min" | "max" => {
            let x = as_number(arg(0)?);
            let y = as_number(arg(1)?);
            match (x, y) {
                (Some(x), Some(y)) => Ok(number_value(if name == "min" {
                    x.min(y)
                } else {
                    x.max(y)
                })),
                _ => Err(StampedeError::Expression(format!(
                    "{name}() expects two numbers"
                ))),
            }
        }
        other => Err(StampedeError::Expression(format!(
            "unknown function \"{other}\""
        ))),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Evaluate an expression against a variable resolver. Unknown identifiers
/// resolve to null; syntax errors and type mismatches are reported as
/// [`StampedeError::Expression`].
pub fn evaluate(
    input: &str,
    resolver: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value, StampedeError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(StampedeError::Expression("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(StampedeError::Expression(format!(
            "trailing tokens after expression in \"{input}\""
        )));
    }
    eval(&ast, resolver)
}

/// Evaluate an expression and coerce the result to a boolean.
pub fn evaluate_bool(
    input: &str,
    resolver: &dyn Fn(&str) -> Option<Value>,
) -> Result<bool, StampedeError> {
    Ok(truthy(&evaluate(input, resolver)?))
}

/// One parsed statement of a hook script.
#[derive(Debug, Clone)]
pub enum Statement {
    /// `set name = expr` — assigns into the VU's variables.
    Set { name: String, expr: String },
    /// A bare expression evaluated for effect-free validation.
    Expr(String),
}

/// Split a hook script into statements. Statements are separated by newlines
/// or semicolons; blank lines and `#` comments are ignored.
pub fn parse_script(script: &str) -> Result<Vec<Statement>, StampedeError> {
    let mut statements = Vec::new();
    for raw in script.split(['\n', ';']) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("set ") {
            let (name, expr) = rest.split_once('=').ok_or_else(|| {
                StampedeError::Expression(format!("set statement missing '=': \"{line}\""))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(StampedeError::Expression(format!(
                    "set statement missing variable name: \"{line}\""
                )));
            }
            statements.push(Statement::Set {
                name: name.to_string(),
                expr: expr.trim().to_string(),
            });
        } else {
            statements.push(Statement::Expr(line.to_string()));
        }
    }
    Ok(statements)
}
