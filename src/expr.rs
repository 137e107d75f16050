//! Guarded expression engine.
//!
//! Compiles a small boolean/temporal predicate language and evaluates it
//! against a single schema-less JSON object tree (an observed Kubernetes
//! resource). Every compiled expression is guaranteed to never panic and
//! never throw: evaluation either returns `true`, `false`, or
//! [`EvalOutcome::Error`] — a failed evaluation is treated as `false` by
//! every caller, never as a reason to archive (invariant 1, `spec.md` §3).

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while compiling an expression (author time).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unexpected end of expression")]
    UnexpectedEof,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid duration literal '{0}': {1}")]
    InvalidDuration(String, String),
    #[error("trailing input after expression: {0}")]
    TrailingInput(String),
}

/// The result of evaluating a compiled expression against an object.
///
/// `Error` is a first-class outcome, not an exception: per `spec.md` §4.1,
/// a syntactically valid expression that fails evaluation (missing field,
/// type mismatch) never archives.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    True,
    False,
    Error(String),
}

impl EvalOutcome {
    /// Collapse to the archive/delete-gating boolean. `Error` is always `false`.
    pub fn fired(&self) -> bool {
        matches!(self, EvalOutcome::True)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EvalOutcome::Error(_))
    }
}

/// A compiled, reusable guarded expression.
///
/// Construct with [`CompiledExpr::compile`]. The empty expression (`""`)
/// compiles successfully and always evaluates to `false` (invariant:
/// "an empty expression never fires", `spec.md` §3).
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    source: String,
    ast: Option<Ast>,
}

impl CompiledExpr {
    /// Compile `source` into a reusable expression.
    ///
    /// Also runs the duration-literal validation pass required by
    /// `spec.md` §4.1: every `duration('…')` lexeme is located, its
    /// balanced argument extracted, and the argument parsed as an RFC
    /// duration. A malformed duration fails compilation even if the rest
    /// of the expression parses.
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Ok(Self {
                source: String::new(),
                ast: None,
            });
        }

        validate_duration_literals(trimmed)?;

        let tokens = lex(trimmed)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(CompileError::TrailingInput(
                parser.tokens[parser.pos..].iter().map(|t| t.text()).collect(),
            ));
        }

        let compiled = Self {
            source: trimmed.to_string(),
            ast: Some(ast),
        };

        // Test-evaluate against an empty object: this is the second half of
        // the author-time duration check (compile the duration, then prove
        // it evaluates without panicking against a minimal object).
        let _ = compiled.evaluate(&Value::Object(Default::default()));

        Ok(compiled)
    }

    /// True if this expression was built from the empty string.
    pub fn is_empty(&self) -> bool {
        self.ast.is_none()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the compiled expression against `object`.
    ///
    /// Never panics. The empty expression always returns `False`.
    pub fn evaluate(&self, object: &Value) -> EvalOutcome {
        match &self.ast {
            None => EvalOutcome::False,
            Some(ast) => eval_node(ast, object),
        }
    }
}

impl PartialEq for Ast {
    fn eq(&self, _other: &Self) -> bool {
        // ASTs are compared only via their source text at the policy-model
        // layer (normalized-whitespace uniqueness, spec.md §4.2 rule 3);
        // structural equality is never required.
        false
    }
}

/* ============================= LEXER ============================= */

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    StringLit(String),
    NumberLit(f64),
    BoolLit(bool),
    LParen,
    RParen,
    Comma,
    Dot,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    fn text(&self) -> String {
        format!("{:?}", self)
    }
}

fn lex(input: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
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
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
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
                    return Err(CompileError::UnterminatedString);
                }
                tokens.push(Token::StringLit(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| CompileError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::NumberLit(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.as_str() {
                    "true" => tokens.push(Token::BoolLit(true)),
                    "false" => tokens.push(Token::BoolLit(false)),
                    _ => tokens.push(Token::Ident(text)),
                }
            }
            other => return Err(CompileError::UnexpectedToken(other.to_string())),
        }
    }

    Ok(tokens)
}

/* ============================= AST ============================= */

#[derive(Debug, Clone)]
enum Ast {
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Eq(Box<Ast>, Box<Ast>),
    Ne(Box<Ast>, Box<Ast>),
    Cmp(CmpOp, Box<Ast>, Box<Ast>),
    Has(FieldPath),
    Call(String, Vec<Ast>),
    Field(FieldPath),
    StringLit(String),
    NumberLit(f64),
    BoolLit(bool),
    Duration(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

type FieldPath = Vec<String>;

impl fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledExpr({:?})", self.source)
    }
}

/* ============================= PARSER ============================= */
//
// Grammar (lowest to highest precedence):
//   or_expr   := and_expr ("||" and_expr)*
//   and_expr  := unary ("&&" unary)*
//   unary     := "!" unary | cmp_expr
//   cmp_expr  := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//   primary   := "(" or_expr ")" | "has(" path ")" | ident "(" args ")"
//              | path | literal

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
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: &Token) -> Result<(), CompileError> {
        match self.advance() {
            Some(t) if &t == tok => Ok(()),
            Some(t) => Err(CompileError::UnexpectedToken(t.text())),
            None => Err(CompileError::UnexpectedEof),
        }
    }

    fn parse_or(&mut self) -> Result<Ast, CompileError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast, CompileError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast, CompileError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Ast, CompileError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some("=="),
            Some(Token::Ne) => Some("!="),
            Some(Token::Lt) => Some("<"),
            Some(Token::Le) => Some("<="),
            Some(Token::Gt) => Some(">"),
            Some(Token::Ge) => Some(">="),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(match op {
            "==" => Ast::Eq(Box::new(left), Box::new(right)),
            "!=" => Ast::Ne(Box::new(left), Box::new(right)),
            "<" => Ast::Cmp(CmpOp::Lt, Box::new(left), Box::new(right)),
            "<=" => Ast::Cmp(CmpOp::Le, Box::new(left), Box::new(right)),
            ">" => Ast::Cmp(CmpOp::Gt, Box::new(left), Box::new(right)),
            ">=" => Ast::Cmp(CmpOp::Ge, Box::new(left), Box::new(right)),
            _ => unreachable!(),
        })
    }

    fn parse_primary(&mut self) -> Result<Ast, CompileError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::StringLit(s)) => Ok(Ast::StringLit(s)),
            Some(Token::NumberLit(n)) => Ok(Ast::NumberLit(n)),
            Some(Token::BoolLit(b)) => Ok(Ast::BoolLit(b)),
            Some(Token::Dot) => {
                let path = self.parse_path()?;
                Ok(Ast::Field(path))
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let args = self.parse_args()?;
                    self.expect(&Token::RParen)?;
                    if name == "has" {
                        let path = match args.first() {
                            Some(Ast::Field(p)) => p.clone(),
                            _ => {
                                return Err(CompileError::UnexpectedToken(
                                    "has() expects a field path".to_string(),
                                ));
                            }
                        };
                        Ok(Ast::Has(path))
                    } else if name == "duration" {
                        let lit = match args.first() {
                            Some(Ast::StringLit(s)) => s.clone(),
                            _ => {
                                return Err(CompileError::UnexpectedToken(
                                    "duration() expects a string literal".to_string(),
                                ));
                            }
                        };
                        let d = parse_rfc_duration(&lit)
                            .map_err(|e| CompileError::InvalidDuration(lit.clone(), e))?;
                        Ok(Ast::Duration(d))
                    } else {
                        Ok(Ast::Call(name, args))
                    }
                } else {
                    // bare identifier is a single-segment field path
                    Ok(Ast::Field(vec![name]))
                }
            }
            Some(t) => Err(CompileError::UnexpectedToken(t.text())),
            None => Err(CompileError::UnexpectedEof),
        }
    }

    fn parse_path(&mut self) -> Result<FieldPath, CompileError> {
        let mut path = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Ident(seg)) => path.push(seg),
                other => {
                    return Err(CompileError::UnexpectedToken(
                        other.map(|t| t.text()).unwrap_or_default(),
                    ));
                }
            }
            if matches!(self.peek(), Some(Token::Dot)) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(path)
    }

    fn parse_args(&mut self) -> Result<Vec<Ast>, CompileError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if matches!(self.peek(), Some(Token::Comma)) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(args)
    }
}

/* ============================= DURATION PARSING ============================= */

/// Parse an RFC-duration-like literal: a sequence of `<number><unit>` pairs,
/// units `h`, `m`, `s` (e.g. `"1h30m"`, `"45s"`, `"10m"`).
fn parse_rfc_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::zero();
    let mut num_start = 0;
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut consumed_any = false;

    while i < chars.len() {
        num_start = i;
        if !chars[i].is_ascii_digit() && chars[i] != '.' {
            return Err(format!("expected digit at position {i}"));
        }
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
            i += 1;
        }
        let num_str: String = chars[num_start..i].iter().collect();
        let value: f64 = num_str
            .parse()
            .map_err(|_| format!("invalid number '{num_str}'"))?;

        if i >= chars.len() {
            return Err("missing unit suffix".to_string());
        }
        let unit = chars[i];
        i += 1;

        let millis = match unit {
            'h' => value * 3_600_000.0,
            'm' => value * 60_000.0,
            's' => value * 1_000.0,
            other => return Err(format!("unknown duration unit '{other}'")),
        };
        total = total + Duration::milliseconds(millis as i64);
        consumed_any = true;
    }

    if !consumed_any {
        return Err("no duration components parsed".to_string());
    }

    Ok(total)
}

/// Locate every `duration(` lexeme, extract its balanced argument, and
/// validate it parses — the author-time check mandated by `spec.md` §4.1.
fn validate_duration_literals(source: &str) -> Result<(), CompileError> {
    let needle = "duration(";
    let mut search_from = 0;
    while let Some(rel) = source[search_from..].find(needle) {
        let start = search_from + rel + needle.len();
        let bytes = source.as_bytes();
        let mut depth = 1usize;
        let mut i = start;
        while i < bytes.len() && depth > 0 {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            if depth == 0 {
                break;
            }
            i += 1;
        }
        if depth != 0 {
            return Err(CompileError::UnexpectedEof);
        }
        let arg = source[start..i].trim();
        let lit = arg
            .trim_matches(|c| c == '\'' || c == '"')
            .to_string();
        parse_rfc_duration(&lit).map_err(|e| CompileError::InvalidDuration(lit, e))?;

        search_from = i + 1;
        if search_from >= source.len() {
            break;
        }
    }
    Ok(())
}

/* ============================= EVALUATION ============================= */

fn eval_node(ast: &Ast, object: &Value) -> EvalOutcome {
    match ast {
        Ast::And(l, r) => match (eval_node(l, object), eval_node(r, object)) {
            (EvalOutcome::Error(e), _) | (_, EvalOutcome::Error(e)) => EvalOutcome::Error(e),
            (EvalOutcome::True, EvalOutcome::True) => EvalOutcome::True,
            _ => EvalOutcome::False,
        },
        Ast::Or(l, r) => match (eval_node(l, object), eval_node(r, object)) {
            (EvalOutcome::True, _) | (_, EvalOutcome::True) => EvalOutcome::True,
            (EvalOutcome::Error(e), EvalOutcome::False) | (EvalOutcome::False, EvalOutcome::Error(e)) => {
                EvalOutcome::Error(e)
            }
            (EvalOutcome::Error(e), _) => EvalOutcome::Error(e),
            _ => EvalOutcome::False,
        },
        Ast::Not(inner) => match eval_node(inner, object) {
            EvalOutcome::True => EvalOutcome::False,
            EvalOutcome::False => EvalOutcome::True,
            EvalOutcome::Error(e) => EvalOutcome::Error(e),
        },
        Ast::Has(path) => match resolve_path(object, path) {
            Some(_) => EvalOutcome::True,
            None => EvalOutcome::False,
        },
        Ast::Eq(l, r) => compare_values(l, r, object, |a, b| a == b),
        Ast::Ne(l, r) => compare_values(l, r, object, |a, b| a != b),
        Ast::Cmp(op, l, r) => eval_cmp(*op, l, r, object),
        Ast::Call(name, args) => eval_call(name, args, object),
        Ast::Field(_) | Ast::StringLit(_) | Ast::NumberLit(_) | Ast::BoolLit(_) | Ast::Duration(_) => {
            // A bare value used as a top-level predicate: truthy coercion.
            match resolve_literal(ast, object) {
                Ok(LitVal::Bool(b)) => {
                    if b {
                        EvalOutcome::True
                    } else {
                        EvalOutcome::False
                    }
                }
                Ok(_) => EvalOutcome::Error("non-boolean used as predicate".to_string()),
                Err(e) => EvalOutcome::Error(e),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum LitVal {
    Str(String),
    Num(f64),
    Bool(bool),
    Duration(Duration),
    Null,
}

fn resolve_literal(ast: &Ast, object: &Value) -> Result<LitVal, String> {
    match ast {
        Ast::StringLit(s) => Ok(LitVal::Str(s.clone())),
        Ast::NumberLit(n) => Ok(LitVal::Num(*n)),
        Ast::BoolLit(b) => Ok(LitVal::Bool(*b)),
        Ast::Duration(d) => Ok(LitVal::Duration(*d)),
        Ast::Field(path) => match resolve_path(object, path) {
            Some(Value::String(s)) => Ok(LitVal::Str(s.clone())),
            Some(Value::Number(n)) => Ok(LitVal::Num(n.as_f64().unwrap_or(f64::NAN))),
            Some(Value::Bool(b)) => Ok(LitVal::Bool(*b)),
            Some(Value::Null) | None => Ok(LitVal::Null),
            Some(_) => Err(format!("field '{}' is not a scalar", path.join("."))),
        },
        Ast::Call(name, args) => eval_call_literal(name, args, object),
        other => Err(format!("{other:?} is not a literal")),
    }
}

fn eval_call_literal(name: &str, args: &[Ast], object: &Value) -> Result<LitVal, String> {
    match name {
        "age" => {
            let created = resolve_path(object, &["metadata".into(), "creationTimestamp".into()])
                .and_then(|v| v.as_str())
                .ok_or_else(|| "object has no metadata.creationTimestamp".to_string())?;
            let parsed: DateTime<Utc> = created
                .parse()
                .map_err(|_| format!("invalid creationTimestamp '{created}'"))?;
            Ok(LitVal::Duration(Utc::now().signed_duration_since(parsed)))
        }
        other => Err(format!("unknown function '{other}'")),
    }
}

fn eval_call(name: &str, args: &[Ast], object: &Value) -> EvalOutcome {
    match name {
        "contains" | "startsWith" | "endsWith" => {
            if args.len() != 2 {
                return EvalOutcome::Error(format!("{name}() expects 2 arguments"));
            }
            let (Ok(LitVal::Str(haystack)), Ok(LitVal::Str(needle))) =
                (resolve_literal(&args[0], object), resolve_literal(&args[1], object))
            else {
                return EvalOutcome::Error(format!("{name}() expects string arguments"));
            };
            let hit = match name {
                "contains" => haystack.contains(&needle),
                "startsWith" => haystack.starts_with(&needle),
                "endsWith" => haystack.ends_with(&needle),
                _ => unreachable!(),
            };
            if hit {
                EvalOutcome::True
            } else {
                EvalOutcome::False
            }
        }
        other => EvalOutcome::Error(format!("unknown function '{other}'")),
    }
}

fn compare_values(
    l: &Ast,
    r: &Ast,
    object: &Value,
    op: impl Fn(&LitVal, &LitVal) -> bool,
) -> EvalOutcome {
    match (resolve_literal(l, object), resolve_literal(r, object)) {
        (Ok(lv), Ok(rv)) => {
            if op(&lv, &rv) {
                EvalOutcome::True
            } else {
                EvalOutcome::False
            }
        }
        (Err(e), _) | (_, Err(e)) => EvalOutcome::Error(e),
    }
}

fn eval_cmp(op: CmpOp, l: &Ast, r: &Ast, object: &Value) -> EvalOutcome {
    let (lv, rv) = match (resolve_literal(l, object), resolve_literal(r, object)) {
        (Ok(lv), Ok(rv)) => (lv, rv),
        (Err(e), _) | (_, Err(e)) => return EvalOutcome::Error(e),
    };

    let ordering = match (&lv, &rv) {
        (LitVal::Num(a), LitVal::Num(b)) => a.partial_cmp(b),
        (LitVal::Duration(a), LitVal::Duration(b)) => a.partial_cmp(b),
        (LitVal::Str(a), LitVal::Str(b)) => Some(a.cmp(b) as std::cmp::Ordering),
        _ => None,
    };

    let Some(ordering) = ordering else {
        return EvalOutcome::Error("incomparable operand types".to_string());
    };

    let hit = match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
    };

    if hit {
        EvalOutcome::True
    } else {
        EvalOutcome::False
    }
}

fn resolve_path<'a>(object: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = object;
    for seg in path {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

/* ============================= TESTS ============================= */
