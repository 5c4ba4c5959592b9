//! Template selector language: a hand-written recursive-descent parser
//! and tree-walking evaluator for `${selector}` expressions
//! (SPEC_FULL.md §4.4, §9). Deliberately never reaches for a
//! general-purpose expression or script engine.
//!
//! Grammar (informal):
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ( "or" and_expr )*
//! and_expr   := unary ( "and" unary )*
//! unary      := "not" unary | comparison
//! comparison := operand ( cmp_op operand )?
//! operand    := path | literal | "(" expr ")"
//! path       := root ( "." ident | "[" index_or_filter "]" )*
//! root       := ident | "@"
//! cmp_op     := ">=" | "<=" | "==" | "=" | "!=" | ">" | "<"
//! ```

use std::iter::Peekable;
use std::str::Chars;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    #[error("could not parse selector '{selector}': {reason}")]
    Parse { selector: String, reason: String },

    #[error("unknown selector '{0}'")]
    UnknownSelector(String),

    #[error("selector '{0}' did not resolve to a boolean")]
    NotBoolean(String),

    #[error("selector '{0}' used a comparison between incomparable types")]
    TypeMismatch(String),

    #[error("duplicate save_as name '{0}'")]
    DuplicateSaveAs(String),
}

/// The evolving set of variables visible to template selectors during
/// execution of one pipeline attempt (SPEC_FULL.md §4.4 "Execution
/// context").
#[derive(Debug, Clone)]
pub struct Context {
    pub now: DateTime<Utc>,
    pub params: Value,
    pub steps: Map<String, Value>,
    pub event: Option<Value>,
}

impl Context {
    pub fn new(now: DateTime<Utc>, params: Value, event: Option<Value>) -> Self {
        Self {
            now,
            params,
            steps: Map::new(),
            event,
        }
    }
}

/// Rewrites every `${...}` occurrence in `value`, recursing through
/// objects and arrays. Strings with no template span are returned
/// unchanged; a string that is exactly one `${...}` span may resolve
/// to a non-string value.
pub fn resolve_value(value: &Value, ctx: &Context) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves every `${selector}` span within a single string.
pub fn resolve_string(s: &str, ctx: &Context) -> Result<Value, TemplateError> {
    let spans = find_spans(s);
    if spans.is_empty() {
        return Ok(Value::String(s.to_string()));
    }
    if spans.len() == 1 && spans[0].0 == 0 && spans[0].1 == s.len() {
        let selector = &s[spans[0].0 + 2..spans[0].1 - 1];
        return evaluate_selector(selector, ctx);
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for (start, end) in spans {
        out.push_str(&s[last..start]);
        let selector = &s[start + 2..end - 1];
        let value = evaluate_selector(selector, ctx)?;
        out.push_str(&display(&value));
        last = end;
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Evaluates a bare selector (without the surrounding `${}`) and
/// requires the result to be a boolean, for `if` conditions.
pub fn evaluate_condition(selector: &str, ctx: &Context) -> Result<bool, TemplateError> {
    match evaluate_selector(selector, ctx)? {
        Value::Bool(b) => Ok(b),
        _ => Err(TemplateError::NotBoolean(selector.to_string())),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn find_spans(s: &str) -> Vec<(usize, usize)> {
    let bytes = s.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            let mut depth = 1;
            let mut j = i + 2;
            while j < bytes.len() && depth > 0 {
                match bytes[j] {
                    b'{' => depth += 1,
                    b'}' => depth -= 1,
                    _ => {}
                }
                j += 1;
            }
            if depth == 0 {
                spans.push((i, j));
                i = j;
                continue;
            }
        }
        i += 1;
    }
    spans
}

fn evaluate_selector(selector: &str, ctx: &Context) -> Result<Value, TemplateError> {
    let expr = parse(selector)?;
    evaluate(&expr, ctx, None)
}

// ---------------------------------------------------------------- lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    NowOffset(i64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    At,
    And,
    Or,
    Not,
    True,
    False,
    Null,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let mut chars: Peekable<Chars> = input.chars().peekable();
    let mut tokens = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '@' => {
                chars.next();
                tokens.push(Token::At);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    return Err("unexpected '!' (did you mean '!='?)".to_string());
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut lit = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => lit.push(ch),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(lit));
            }
            c if c.is_ascii_digit() => {
                tokens.push(Token::Number(lex_number(&mut chars)));
            }
            '-' if matches!(chars.clone().nth(1), Some(d) if d.is_ascii_digit()) => {
                chars.next();
                let n = lex_number(&mut chars);
                tokens.push(Token::Number(-n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    "now" => {
                        if let Some(&sign) = chars.peek() {
                            if sign == '+' || sign == '-' {
                                let mut lookahead = chars.clone();
                                lookahead.next();
                                if lookahead.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
                                    chars.next();
                                    let magnitude = lex_number(&mut chars);
                                    let unit = chars.next().ok_or("expected duration unit after offset")?;
                                    let seconds = duration_seconds(magnitude, unit)?;
                                    let signed = if sign == '-' { -seconds } else { seconds };
                                    tokens.push(Token::NowOffset(signed));
                                    continue;
                                }
                            }
                        }
                        tokens.push(Token::Ident("now".to_string()));
                    }
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

fn lex_number(chars: &mut Peekable<Chars>) -> f64 {
    let mut digits = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
            chars.next();
        } else {
            break;
        }
    }
    digits.parse().unwrap_or(0.0)
}

fn duration_seconds(magnitude: f64, unit: char) -> Result<i64, String> {
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        other => return Err(format!("unknown duration unit '{other}' (expected h|m|s|d)")),
    };
    Ok((magnitude as i64) * multiplier)
}

// --------------------------------------------------------------- parser

#[derive(Debug, Clone)]
enum Expr {
    Path(Vec<PathSegment>),
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    NowOffset(i64),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

#[derive(Debug, Clone)]
enum PathSegment {
    Root(String),
    Field(String),
    Index(i64),
    Filter(Box<Expr>),
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
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(format!("expected {expected:?}, found {other:?}")),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Lt) => Some(CmpOp::Lt),
            _ => None,
        };
        match op {
            Some(op) => {
                self.next();
                let right = self.parse_operand()?;
                Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr, String> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Number(n)) => {
                self.next();
                Ok(Expr::Number(n))
            }
            Some(Token::Str(s)) => {
                self.next();
                Ok(Expr::Str(s))
            }
            Some(Token::True) => {
                self.next();
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.next();
                Ok(Expr::Bool(false))
            }
            Some(Token::Null) => {
                self.next();
                Ok(Expr::Null)
            }
            Some(Token::NowOffset(secs)) => {
                self.next();
                Ok(Expr::NowOffset(secs))
            }
            Some(Token::Ident(_)) | Some(Token::At) => self.parse_path(),
            other => Err(format!("unexpected token {other:?} in operand position")),
        }
    }

    fn parse_path(&mut self) -> Result<Expr, String> {
        let mut segments = Vec::new();
        match self.next() {
            Some(Token::Ident(name)) => segments.push(PathSegment::Root(name)),
            Some(Token::At) => segments.push(PathSegment::Root("@".to_string())),
            other => return Err(format!("expected path root, found {other:?}")),
        }
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(name)) => segments.push(PathSegment::Field(name)),
                        other => return Err(format!("expected field name after '.', found {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    if let (Some(Token::Number(n)), Some(Token::RBracket)) =
                        (self.peek().cloned(), self.tokens.get(self.pos + 1).cloned())
                    {
                        self.next();
                        self.next();
                        segments.push(PathSegment::Index(n as i64));
                    } else {
                        let predicate = self.parse_expr()?;
                        self.expect(&Token::RBracket)?;
                        segments.push(PathSegment::Filter(Box::new(predicate)));
                    }
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

fn parse(selector: &str) -> Result<Expr, TemplateError> {
    let tokens = lex(selector).map_err(|reason| TemplateError::Parse {
        selector: selector.to_string(),
        reason,
    })?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr().map_err(|reason| TemplateError::Parse {
        selector: selector.to_string(),
        reason,
    })?;
    if parser.pos != parser.tokens.len() {
        return Err(TemplateError::Parse {
            selector: selector.to_string(),
            reason: "trailing tokens after expression".to_string(),
        });
    }
    Ok(expr)
}

// ----------------------------------------------------------- evaluator

fn evaluate(expr: &Expr, ctx: &Context, current: Option<&Value>) -> Result<Value, TemplateError> {
    match expr {
        Expr::Path(segments) => eval_path(segments, ctx, current),
        Expr::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::NowOffset(secs) => Ok(Value::String(
            (ctx.now + ChronoDuration::seconds(*secs)).to_rfc3339(),
        )),
        Expr::Cmp(l, op, r) => {
            let lv = evaluate(l, ctx, current)?;
            let rv = evaluate(r, ctx, current)?;
            Ok(Value::Bool(compare(&lv, &rv, *op)?))
        }
        Expr::And(l, r) => {
            let lv = as_bool(&evaluate(l, ctx, current)?)?;
            if !lv {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&evaluate(r, ctx, current)?)?))
        }
        Expr::Or(l, r) => {
            let lv = as_bool(&evaluate(l, ctx, current)?)?;
            if lv {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&evaluate(r, ctx, current)?)?))
        }
        Expr::Not(e) => Ok(Value::Bool(!as_bool(&evaluate(e, ctx, current)?)?)),
    }
}

fn eval_path(
    segments: &[PathSegment],
    ctx: &Context,
    current: Option<&Value>,
) -> Result<Value, TemplateError> {
    let mut iter = segments.iter();
    let mut value = match iter.next() {
        Some(PathSegment::Root(name)) => resolve_root(name, ctx, current)?,
        _ => return Err(TemplateError::UnknownSelector("<empty path>".to_string())),
    };
    for segment in iter {
        value = match segment {
            PathSegment::Field(name) => value
                .get(name)
                .cloned()
                .ok_or_else(|| TemplateError::UnknownSelector(name.clone()))?,
            PathSegment::Index(i) => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| TemplateError::UnknownSelector(format!("[{i}]")))?;
                let idx = if *i < 0 { arr.len() as i64 + i } else { *i };
                if idx < 0 {
                    return Err(TemplateError::UnknownSelector(format!("[{i}]")));
                }
                arr.get(idx as usize)
                    .cloned()
                    .ok_or_else(|| TemplateError::UnknownSelector(format!("[{i}]")))?
            }
            PathSegment::Filter(predicate) => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| TemplateError::UnknownSelector("[filter]".to_string()))?;
                let mut filtered = Vec::new();
                for element in arr {
                    if as_bool(&evaluate(predicate, ctx, Some(element))?)? {
                        filtered.push(element.clone());
                    }
                }
                Value::Array(filtered)
            }
            PathSegment::Root(_) => unreachable!("root only appears first"),
        };
    }
    Ok(value)
}

fn resolve_root(name: &str, ctx: &Context, current: Option<&Value>) -> Result<Value, TemplateError> {
    match name {
        "params" => Ok(ctx.params.clone()),
        "steps" => Ok(Value::Object(ctx.steps.clone())),
        "event" => Ok(ctx.event.clone().unwrap_or(Value::Null)),
        "now" => Ok(Value::String(ctx.now.to_rfc3339())),
        "@" => current
            .cloned()
            .ok_or_else(|| TemplateError::UnknownSelector("'@' used outside a filter".to_string())),
        other => Err(TemplateError::UnknownSelector(other.to_string())),
    }
}

fn as_bool(value: &Value) -> Result<bool, TemplateError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(TemplateError::NotBoolean(other.to_string())),
    }
}

fn compare(left: &Value, right: &Value, op: CmpOp) -> Result<bool, TemplateError> {
    use CmpOp::*;
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            Ok(match op {
                Eq => l == r,
                Ne => l != r,
                Ge => l >= r,
                Le => l <= r,
                Gt => l > r,
                Lt => l < r,
            })
        }
        (Value::String(l), Value::String(r)) => Ok(match op {
            Eq => l == r,
            Ne => l != r,
            Ge => l >= r,
            Le => l <= r,
            Gt => l > r,
            Lt => l < r,
        }),
        (Value::Bool(l), Value::Bool(r)) => match op {
            Eq => Ok(l == r),
            Ne => Ok(l != r),
            _ => Err(TemplateError::TypeMismatch("ordered comparison of booleans".to_string())),
        },
        (Value::Null, Value::Null) => Ok(matches!(op, Eq)),
        _ => match op {
            Eq => Ok(false),
            Ne => Ok(true),
            _ => Err(TemplateError::TypeMismatch(
                "ordered comparison between incompatible types".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> Context {
        let mut steps = Map::new();
        steps.insert("A".to_string(), serde_json::json!({"v": 42}));
        Context {
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            params: serde_json::json!({"name": "nightly"}),
            steps,
            event: None,
        }
    }

    #[test]
    fn whole_string_selector_preserves_non_string_types() {
        let value = resolve_string("${steps.A.v}", &ctx()).unwrap();
        assert_eq!(value, serde_json::json!(42));
    }

    #[test]
    fn embedded_selector_substitutes_textually() {
        let value = resolve_string("value is ${steps.A.v} units", &ctx()).unwrap();
        assert_eq!(value, Value::String("value is 42 units".to_string()));
    }

    #[test]
    fn comparison_condition_evaluates_to_bool() {
        assert!(evaluate_condition("steps.A.v > 0", &ctx()).unwrap());
        assert!(!evaluate_condition("steps.A.v > 100", &ctx()).unwrap());
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let err = resolve_string("${params.missing}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownSelector(_)));
    }

    #[test]
    fn now_offset_adds_duration() {
        let value = resolve_string("${now+1h}", &ctx()).unwrap();
        let rendered = match value {
            Value::String(s) => s,
            _ => panic!("expected string"),
        };
        assert!(rendered.starts_with("2024-01-01T01:00:00"));
    }

    #[test]
    fn template_resolution_applied_twice_is_a_no_op() {
        let once = resolve_string("value is ${steps.A.v} units", &ctx()).unwrap();
        let once_str = match once {
            Value::String(s) => s,
            other => panic!("expected string, got {other:?}"),
        };
        let twice = resolve_string(&once_str, &ctx()).unwrap();
        assert_eq!(twice, Value::String(once_str));
    }

    #[test]
    fn filter_predicate_selects_matching_elements() {
        let mut c = ctx();
        c.params = serde_json::json!({"items": [{"n": 1}, {"n": 5}, {"n": 9}]});
        let value = resolve_string("${params.items[@.n > 3]}", &c).unwrap();
        assert_eq!(value, serde_json::json!([{"n": 5}, {"n": 9}]));
    }
}
