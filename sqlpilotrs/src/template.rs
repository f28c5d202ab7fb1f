//! `{{ expr }}` expansion for user SQL, virtual datasets and extra WHERE/HAVING text.
//!
//! The language is small. An expression is a literal, a dotted
//! name looked up in the template parameters, or a macro call, followed by any
//! number of `| filter` applications. `{# ... #}` comments are removed. Output
//! is produced in a single pass; expanded text is never re-scanned.

use chrono::{NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, SqlPilotError};
use crate::query_spec::{Filter, FilterOp};

/// Values visible to templates during one expansion.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub username: Option<String>,
    pub user_id: Option<i64>,
    pub url_params: Map<String, Value>,
    /// Request filters, consulted by `filter_values`.
    pub filters: Vec<Filter>,
    /// Named parameters; identifiers resolve here.
    pub params: Map<String, Value>,
    /// Fixed clock for `now()`; wall clock when unset.
    pub now: Option<NaiveDateTime>,
}

impl TemplateContext {
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Add `defaults` for every key not already set.
    pub fn merge_defaults(&mut self, defaults: &Map<String, Value>) {
        for (k, v) in defaults {
            self.params.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

pub struct TemplateProcessor;

impl TemplateProcessor {
    pub fn expand(text: &str, context: &TemplateContext) -> Result<String> {
        if !text.contains("{{") && !text.contains("{#") && !text.contains("{%") {
            return Ok(text.to_string());
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        loop {
            let next = ["{{", "{#", "{%"]
                .iter()
                .filter_map(|open| rest.find(open).map(|idx| (idx, *open)))
                .min_by_key(|(idx, _)| *idx);
            let Some((idx, open)) = next else {
                out.push_str(rest);
                break;
            };
            out.push_str(&rest[..idx]);
            let body_start = idx + 2;
            match open {
                "{#" => {
                    let end = rest[body_start..].find("#}").ok_or_else(|| {
                        template_error(format!("unclosed comment at offset {}", text.len() - rest.len() + idx))
                    })?;
                    rest = &rest[body_start + end + 2..];
                }
                "{%" => {
                    return Err(template_error("statement blocks ({% %}) are not supported"));
                }
                _ => {
                    let end = find_close(&rest[body_start..]).ok_or_else(|| {
                        template_error(format!(
                            "unclosed '{{{{' at offset {}",
                            text.len() - rest.len() + idx
                        ))
                    })?;
                    let expr = &rest[body_start..body_start + end];
                    let value = Evaluator::new(context).evaluate(expr)?;
                    out.push_str(&render(&value));
                    rest = &rest[body_start + end + 2..];
                }
            }
        }
        Ok(out)
    }
}

fn template_error(msg: impl Into<String>) -> SqlPilotError {
    SqlPilotError::Template(msg.into())
}

/// Offset of the closing `}}`, skipping quoted strings.
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

/// Output form of a value. Lists render as a SQL literal list.
fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(sql_quote)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn sql_quote(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Null => "NULL".to_string(),
        Value::Array(items) => items.iter().map(sql_quote).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    LParen,
    RParen,
    Comma,
    Pipe,
    Dot,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(template_error("unterminated string literal")),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num: Value = serde_json::from_str(&text)
                    .map_err(|_| template_error(format!("invalid number literal {text}")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(template_error(format!(
                    "unexpected character '{other}' in expression"
                )))
            }
        }
    }
    Ok(tokens)
}

/// Result of evaluating a sub-expression; undefined names stay lazy so
/// `| default(...)` can replace them.
#[derive(Debug, Clone)]
enum Eval {
    Defined(Value),
    Undefined(String),
}

impl Eval {
    fn require(self) -> Result<Value> {
        match self {
            Eval::Defined(v) => Ok(v),
            Eval::Undefined(name) => Err(template_error(format!("'{name}' is undefined"))),
        }
    }
}

struct Evaluator<'c> {
    ctx: &'c TemplateContext,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'c> Evaluator<'c> {
    fn new(ctx: &'c TemplateContext) -> Self {
        Self {
            ctx,
            tokens: Vec::new(),
            pos: 0,
        }
    }

    fn evaluate(mut self, expr: &str) -> Result<Value> {
        self.tokens = tokenize(expr)?;
        if self.tokens.is_empty() {
            return Err(template_error("empty expression"));
        }
        let value = self.expression()?;
        if let Some(tok) = self.peek() {
            return Err(template_error(format!("unexpected token {tok:?}")));
        }
        value.require()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(template_error(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn expression(&mut self) -> Result<Eval> {
        let mut value = self.primary()?;
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                other => return Err(template_error(format!("expected filter name, found {other:?}"))),
            };
            let args = if self.peek() == Some(&Token::LParen) {
                self.arguments()?
            } else {
                Vec::new()
            };
            value = self.apply_filter(&name, value, args)?;
        }
        Ok(value)
    }

    fn arguments(&mut self) -> Result<Vec<Value>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?.require()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => return Err(template_error(format!("expected ',' or ')', found {other:?}"))),
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Eval> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Eval::Defined(Value::String(s))),
            Some(Token::Num(n)) => Ok(Eval::Defined(n)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                match name.as_str() {
                    "true" | "True" => return Ok(Eval::Defined(Value::Bool(true))),
                    "false" | "False" => return Ok(Eval::Defined(Value::Bool(false))),
                    "none" | "None" => return Ok(Eval::Defined(Value::Null)),
                    _ => {}
                }
                if self.peek() == Some(&Token::LParen) {
                    let args = self.arguments()?;
                    return self.call(&name, args).map(Eval::Defined);
                }
                let mut path = name.clone();
                let mut current = self.ctx.params.get(&name).cloned();
                while self.peek() == Some(&Token::Dot) {
                    self.pos += 1;
                    let field = match self.next() {
                        Some(Token::Ident(field)) => field,
                        other => {
                            return Err(template_error(format!(
                                "expected attribute name, found {other:?}"
                            )))
                        }
                    };
                    path = format!("{path}.{field}");
                    current = current.and_then(|v| v.get(&field).cloned());
                }
                Ok(match current {
                    Some(v) => Eval::Defined(v),
                    None => Eval::Undefined(path),
                })
            }
            other => Err(template_error(format!("unexpected token {other:?}"))),
        }
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match name {
            "now" | "current_timestamp" => {
                let now = self.ctx.now.unwrap_or_else(|| Utc::now().naive_utc());
                Ok(Value::String(now.format("%Y-%m-%d %H:%M:%S").to_string()))
            }
            "current_username" => Ok(self
                .ctx
                .username
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null)),
            "current_user_id" => Ok(self.ctx.user_id.map(Value::from).unwrap_or(Value::Null)),
            "url_param" => {
                let key = arg_string(name, &args, 0)?;
                Ok(self
                    .ctx
                    .url_params
                    .get(&key)
                    .cloned()
                    .or_else(|| args.get(1).cloned())
                    .unwrap_or(Value::Null))
            }
            "filter_values" => {
                let column = arg_string(name, &args, 0)?;
                let mut values = Vec::new();
                for filter in &self.ctx.filters {
                    if filter.col.as_deref() != Some(column.as_str()) {
                        continue;
                    }
                    if !matches!(filter.op, Some(FilterOp::In) | Some(FilterOp::Eq)) {
                        continue;
                    }
                    match &filter.val {
                        Value::Array(items) => values.extend(items.iter().cloned()),
                        Value::Null => {}
                        other => values.push(other.clone()),
                    }
                }
                if values.is_empty() {
                    if let Some(default) = args.get(1) {
                        values.push(default.clone());
                    }
                }
                Ok(Value::Array(values))
            }
            other => Err(template_error(format!("'{other}' is undefined"))),
        }
    }

    fn apply_filter(&self, name: &str, value: Eval, args: Vec<Value>) -> Result<Eval> {
        if name == "default" {
            return Ok(match value {
                Eval::Defined(Value::Null) | Eval::Undefined(_) => {
                    Eval::Defined(args.into_iter().next().unwrap_or(Value::String(String::new())))
                }
                defined => defined,
            });
        }
        let value = value.require()?;
        let out = match name {
            "upper" => Value::String(plain(&value).to_uppercase()),
            "lower" => Value::String(plain(&value).to_lowercase()),
            "join" => {
                let sep = args.first().map(plain).unwrap_or_default();
                match &value {
                    Value::Array(items) => {
                        Value::String(items.iter().map(plain).collect::<Vec<_>>().join(&sep))
                    }
                    other => Value::String(plain(other)),
                }
            }
            "sqlquote" => Value::String(sql_quote(&value)),
            other => return Err(template_error(format!("no filter named '{other}'"))),
        };
        Ok(Eval::Defined(out))
    }
}

fn arg_string(func: &str, args: &[Value], idx: usize) -> Result<String> {
    match args.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(plain(other)),
        None => Err(template_error(format!("{func}() missing argument {}", idx + 1))),
    }
}
