//! Restricted expression grammar for step conditions.
//!
//! This is a deliberately small interpreter, not a host eval: field access,
//! indexing, comparisons, boolean and ternary operators, array literals and
//! `.every` / `.some` / `.includes` / `.length` postfixes, evaluated over
//! JSON values. Nothing outside the bound scope is reachable.

use serde_json::{Number, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;

/// Lexing or parsing failure (reported by `validate_condition`) versus an
/// evaluation failure (undefined name, bad member access, type mismatch).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("evaluation error: {0}")]
    Eval(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Arrow,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "'{s}'"),
            other => write!(f, "{other:?}"),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, ConditionError> {
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '!' => match (chars.get(i + 1), chars.get(i + 2)) {
                (Some('='), Some('=')) => {
                    tokens.push(Token::Ne);
                    i += 3;
                }
                (Some('='), _) => {
                    tokens.push(Token::Ne);
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Not);
                    i += 1;
                }
            },
            '=' => match (chars.get(i + 1), chars.get(i + 2)) {
                (Some('='), Some('=')) => {
                    tokens.push(Token::Eq);
                    i += 3;
                }
                (Some('='), _) => {
                    tokens.push(Token::Eq);
                    i += 2;
                }
                (Some('>'), _) => {
                    tokens.push(Token::Arrow);
                    i += 2;
                }
                _ => return Err(ConditionError::Syntax("unexpected '='".to_string())),
            },
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
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(ConditionError::Syntax("expected '&&'".to_string()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(ConditionError::Syntax("expected '||'".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(&esc) => s.push(esc),
                                None => {
                                    return Err(ConditionError::Syntax(
                                        "unterminated string".to_string(),
                                    ));
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ConditionError::Syntax("unterminated string".to_string()));
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ConditionError::Syntax(format!("bad number '{text}'")))?;
                tokens.push(Token::Number(n));
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
                    "null" | "undefined" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ConditionError::Syntax(format!(
                    "unexpected character '{other}'"
                )));
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(JsonValue),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `.every(x => body)` / `.some(x => body)` over an array value.
    Quantifier {
        every: bool,
        target: Box<Expr>,
        param: String,
        body: Box<Expr>,
    },
    Includes(Box<Expr>, Box<Expr>),
    Length(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
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
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<(), ConditionError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(ConditionError::Syntax(format!(
                "expected {token}, found {t}"
            ))),
            None => Err(ConditionError::Syntax(format!(
                "expected {token}, found end of input"
            ))),
        }
    }

    fn ternary(&mut self) -> Result<Expr, ConditionError> {
        let cond = self.or()?;
        if self.peek() == Some(&Token::Question) {
            self.next();
            let then = self.ternary()?;
            self.expect(Token::Colon)?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.next();
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.next();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(ConditionError::Syntax(format!(
                                "expected member name after '.', found {}",
                                other.map(|t| t.to_string()).unwrap_or_else(|| "end".into())
                            )));
                        }
                    };
                    expr = match name.as_str() {
                        "every" | "some" if self.peek() == Some(&Token::LParen) => {
                            let every = name == "every";
                            self.next();
                            let param = match self.next() {
                                Some(Token::Ident(p)) => p,
                                _ => {
                                    return Err(ConditionError::Syntax(
                                        "expected parameter name in lambda".to_string(),
                                    ));
                                }
                            };
                            self.expect(Token::Arrow)?;
                            let body = self.ternary()?;
                            self.expect(Token::RParen)?;
                            Expr::Quantifier {
                                every,
                                target: Box::new(expr),
                                param,
                                body: Box::new(body),
                            }
                        }
                        "includes" if self.peek() == Some(&Token::LParen) => {
                            self.next();
                            let needle = self.ternary()?;
                            self.expect(Token::RParen)?;
                            Expr::Includes(Box::new(expr), Box::new(needle))
                        }
                        "length" => Expr::Length(Box::new(expr)),
                        _ => Expr::Member(Box::new(expr), name),
                    };
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.ternary()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::True) => Ok(Expr::Literal(JsonValue::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(JsonValue::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(JsonValue::Null)),
            Some(Token::Number(n)) => Ok(Expr::Literal(
                Number::from_f64(n).map(JsonValue::Number).unwrap_or(JsonValue::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(JsonValue::String(s))),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            Some(t) => Err(ConditionError::Syntax(format!("unexpected token {t}"))),
            None => Err(ConditionError::Syntax("unexpected end of input".to_string())),
        }
    }
}

/// Parses a condition expression into its AST.
pub fn parse(input: &str) -> Result<Expr, ConditionError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(ConditionError::Syntax("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(ConditionError::Syntax(format!(
            "trailing tokens after expression (at token {})",
            parser.pos
        )));
    }
    Ok(expr)
}

/// The delimited evaluation scope: the three bound context names plus any
/// lambda parameters pushed during `.every` / `.some`.
pub struct Scope<'a> {
    bindings: &'a HashMap<String, JsonValue>,
    locals: Vec<(String, JsonValue)>,
}

impl<'a> Scope<'a> {
    pub fn new(bindings: &'a HashMap<String, JsonValue>) -> Self {
        Self {
            bindings,
            locals: Vec::new(),
        }
    }

    fn resolve(&self, name: &str) -> Option<&JsonValue> {
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.bindings.get(name))
    }
}

/// JavaScript-style truthiness: `false`, `null`, `0`, `""` and `[]` are
/// falsy, everything else is truthy.
pub fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(_) => true,
    }
}

pub fn eval(expr: &Expr, scope: &mut Scope<'_>) -> Result<JsonValue, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => scope
            .resolve(name)
            .cloned()
            .ok_or_else(|| ConditionError::Eval(format!("'{name}' is not defined"))),
        Expr::Member(target, name) => {
            let value = eval(target, scope)?;
            match value {
                JsonValue::Object(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConditionError::Eval(format!("no such field '{name}'"))),
                other => Err(ConditionError::Eval(format!(
                    "cannot read '{name}' of {}",
                    type_name(&other)
                ))),
            }
        }
        Expr::Index(target, index) => {
            let value = eval(target, scope)?;
            let key = eval(index, scope)?;
            match (&value, &key) {
                (JsonValue::Object(map), JsonValue::String(k)) => map
                    .get(k)
                    .cloned()
                    .ok_or_else(|| ConditionError::Eval(format!("no such key '{k}'"))),
                (JsonValue::Array(items), JsonValue::Number(n)) => {
                    let i = n.as_f64().unwrap_or(-1.0);
                    if i >= 0.0 && (i as usize) < items.len() {
                        Ok(items[i as usize].clone())
                    } else {
                        Err(ConditionError::Eval(format!("index {i} out of bounds")))
                    }
                }
                _ => Err(ConditionError::Eval(format!(
                    "cannot index {} with {}",
                    type_name(&value),
                    type_name(&key)
                ))),
            }
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope)?);
            }
            Ok(JsonValue::Array(out))
        }
        Expr::Not(inner) => {
            let v = eval(inner, scope)?;
            Ok(JsonValue::Bool(!truthy(&v)))
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, scope),
        Expr::Ternary(cond, then, otherwise) => {
            let c = eval(cond, scope)?;
            if truthy(&c) {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Expr::Quantifier {
            every,
            target,
            param,
            body,
        } => {
            let value = eval(target, scope)?;
            let items = match value {
                JsonValue::Array(items) => items,
                other => {
                    return Err(ConditionError::Eval(format!(
                        "cannot iterate {}",
                        type_name(&other)
                    )));
                }
            };
            for item in items {
                scope.locals.push((param.clone(), item));
                let result = eval(body, scope);
                scope.locals.pop();
                let holds = truthy(&result?);
                if *every && !holds {
                    return Ok(JsonValue::Bool(false));
                }
                if !*every && holds {
                    return Ok(JsonValue::Bool(true));
                }
            }
            Ok(JsonValue::Bool(*every))
        }
        Expr::Includes(target, needle) => {
            let value = eval(target, scope)?;
            let needle = eval(needle, scope)?;
            match (&value, &needle) {
                (JsonValue::Array(items), n) => Ok(JsonValue::Bool(items.contains(n))),
                (JsonValue::String(s), JsonValue::String(sub)) => {
                    Ok(JsonValue::Bool(s.contains(sub.as_str())))
                }
                _ => Err(ConditionError::Eval(format!(
                    "cannot call includes on {}",
                    type_name(&value)
                ))),
            }
        }
        Expr::Length(target) => {
            let value = eval(target, scope)?;
            let len = match &value {
                JsonValue::Array(items) => items.len(),
                JsonValue::String(s) => s.chars().count(),
                other => {
                    return Err(ConditionError::Eval(format!(
                        "{} has no length",
                        type_name(other)
                    )));
                }
            };
            Ok(JsonValue::Number(Number::from(len as u64)))
        }
    }
}

fn eval_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    scope: &mut Scope<'_>,
) -> Result<JsonValue, ConditionError> {
    // Short-circuit the boolean operators before touching the right side.
    match op {
        BinOp::And => {
            let l = eval(left, scope)?;
            if !truthy(&l) {
                return Ok(JsonValue::Bool(false));
            }
            let r = eval(right, scope)?;
            return Ok(JsonValue::Bool(truthy(&r)));
        }
        BinOp::Or => {
            let l = eval(left, scope)?;
            if truthy(&l) {
                return Ok(JsonValue::Bool(true));
            }
            let r = eval(right, scope)?;
            return Ok(JsonValue::Bool(truthy(&r)));
        }
        _ => {}
    }

    let l = eval(left, scope)?;
    let r = eval(right, scope)?;
    let result = match op {
        BinOp::Eq => l == r,
        BinOp::Ne => l != r,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&l, &r)?;
            match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    };
    Ok(JsonValue::Bool(result))
}

fn compare(l: &JsonValue, r: &JsonValue) -> Result<std::cmp::Ordering, ConditionError> {
    match (l, r) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| ConditionError::Eval("cannot compare NaN".to_string()))
        }
        (JsonValue::String(a), JsonValue::String(b)) => Ok(a.cmp(b)),
        _ => Err(ConditionError::Eval(format!(
            "cannot compare {} with {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn type_name(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
