//! Scripted matchers.
//!
//! Two back-ends, both side-effect free on the metadata:
//! - a boolean expression language over connection fields with injected
//!   helpers (`resolve_ip`, `geoip`, `in_cidr`, `in_ipset`,
//!   `match_provider`, `resolve_process_name`, `resolve_process_path`);
//! - a restricted `def main(ctx, metadata):` interpreter (if/elif/else and
//!   return over the same expressions) plus named shortcuts.
//!
//! Helpers that perform I/O surface failures as false/empty values; a type
//! error is a script error the engine treats as a non-match.

use crate::common::Metadata;
use crate::dns::Resolver;
use crate::geodata::GeoData;
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::net::IpAddr;
use std::sync::Arc;

/// Read-only provider view injected into scripts.
pub trait ProviderMatch: Send + Sync {
    /// Whether provider `name` matches the metadata; None if unknown
    fn match_metadata(&self, name: &str, metadata: &Metadata) -> Option<bool>;

    /// Whether `ip` belongs to the named IP set; None if unknown
    fn match_ip(&self, name: &str, ip: IpAddr) -> Option<bool>;

    /// Whether provider `name` matches on destination addresses, so the
    /// engine should resolve before asking it
    fn provider_needs_ip(&self, _name: &str) -> bool {
        false
    }
}

/// Ambient services available to helpers.
pub struct ScriptEnv {
    pub resolver: Arc<Resolver>,
    pub geodata: Arc<GeoData>,
    pub providers: Arc<dyn ProviderMatch>,
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
    Dot,
    LBracket,
    RBracket,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' => i += 1,
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
            '=' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if bytes.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(Error::script("unterminated string literal"));
                }
                tokens.push(Token::Str(bytes[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| Error::script(format!("bad integer: {}", text)))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_') {
                    i += 1;
                }
                let word: String = bytes[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(Error::script(format!("unexpected character: {:?}", other)))
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

/// Metadata field accessible to expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Network,
    SourceKind,
    Host,
    DstIp,
    SrcIp,
    DstPort,
    SrcPort,
    ProcessName,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "network" => Some(Field::Network),
            "type" => Some(Field::SourceKind),
            "host" => Some(Field::Host),
            "dst_ip" => Some(Field::DstIp),
            "src_ip" => Some(Field::SrcIp),
            "dst_port" => Some(Field::DstPort),
            "src_port" => Some(Field::SrcPort),
            "process_name" => Some(Field::ProcessName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    Field(Field),
    Call { name: String, args: Vec<Expr> },
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

const HELPERS: &[&str] = &[
    "resolve_ip",
    "geoip",
    "in_cidr",
    "in_ipset",
    "match_provider",
    "resolve_process_name",
    "resolve_process_path",
];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    providers: Vec<String>,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            providers: Vec::new(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(Error::script(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_primary()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.parse_ident(name),
            other => Err(Error::script(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_ident(&mut self, name: String) -> Result<Expr> {
        match name.as_str() {
            "True" | "true" => return Ok(Expr::Bool(true)),
            "False" | "false" => return Ok(Expr::Bool(false)),
            // `ctx.rule_providers["X"].match(metadata)` sugar
            "ctx" => return self.parse_ctx_chain(),
            _ => {}
        }

        if self.peek() == Some(&Token::LParen) {
            self.next();
            let mut args = Vec::new();
            if self.peek() != Some(&Token::RParen) {
                loop {
                    args.push(self.parse_expr()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        other => {
                            return Err(Error::script(format!(
                                "expected , or ) in call, found {:?}",
                                other
                            )))
                        }
                    }
                }
            } else {
                self.next();
            }

            if !HELPERS.contains(&name.as_str()) {
                return Err(Error::script(format!("unknown helper: {}", name)));
            }
            self.record_provider_ref(&name, &args);
            return Ok(Expr::Call { name, args });
        }

        match Field::parse(&name) {
            Some(field) => Ok(Expr::Field(field)),
            None => Err(Error::script(format!("unknown identifier: {}", name))),
        }
    }

    /// Recognize `ctx.rule_providers["X"].match(metadata)` and lower it to
    /// `match_provider("X")`.
    fn parse_ctx_chain(&mut self) -> Result<Expr> {
        self.expect(Token::Dot)?;
        match self.next() {
            Some(Token::Ident(attr)) if attr == "rule_providers" => {}
            other => {
                return Err(Error::script(format!(
                    "unsupported ctx attribute: {:?}",
                    other
                )))
            }
        }
        self.expect(Token::LBracket)?;
        let provider = match self.next() {
            Some(Token::Str(s)) => s,
            other => {
                return Err(Error::script(format!(
                    "rule_providers index must be a string, found {:?}",
                    other
                )))
            }
        };
        self.expect(Token::RBracket)?;
        self.expect(Token::Dot)?;
        match self.next() {
            Some(Token::Ident(method)) if method == "match" => {}
            other => return Err(Error::script(format!("unsupported method: {:?}", other))),
        }
        self.expect(Token::LParen)?;
        // Accept and discard the metadata argument
        if let Some(Token::Ident(_)) = self.peek() {
            self.next();
        }
        self.expect(Token::RParen)?;

        self.providers.push(provider.clone());
        Ok(Expr::Call {
            name: "match_provider".to_string(),
            args: vec![Expr::Str(provider)],
        })
    }

    fn record_provider_ref(&mut self, helper: &str, args: &[Expr]) {
        if helper == "match_provider" || helper == "in_ipset" {
            if let Some(Expr::Str(name)) = args.first() {
                self.providers.push(name.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(s) => s.parse().ok(),
            Value::Bool(_) => None,
        }
    }

    fn loose_eq(&self, other: &Value) -> bool {
        if self == other {
            return true;
        }
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// A compiled boolean expression over connection metadata.
pub struct CompiledExpr {
    src: String,
    ast: Expr,
    referenced_providers: Vec<String>,
}

impl CompiledExpr {
    pub fn compile(src: &str) -> Result<Self> {
        let tokens = tokenize(src)?;
        let mut parser = Parser::new(tokens);
        let ast = parser.parse_expr()?;
        if parser.peek().is_some() {
            return Err(Error::script(format!(
                "trailing tokens in expression: {}",
                src
            )));
        }
        Ok(CompiledExpr {
            src: src.to_string(),
            ast,
            referenced_providers: parser.providers,
        })
    }

    pub fn source(&self) -> &str {
        &self.src
    }

    /// Provider names referenced via `match_provider`/`in_ipset`; the
    /// loader pre-registers these as GEOSITE rule providers.
    pub fn referenced_providers(&self) -> &[String] {
        &self.referenced_providers
    }

    pub async fn evaluate(&self, metadata: &Metadata, env: &ScriptEnv) -> Result<bool> {
        Ok(eval(&self.ast, metadata, env).await?.truthy())
    }
}

fn field_value(field: Field, metadata: &Metadata) -> Value {
    match field {
        Field::Network => Value::Str(metadata.network.to_string().to_lowercase()),
        Field::SourceKind => Value::Str(metadata.source_type.to_string().to_lowercase()),
        Field::Host => Value::Str(metadata.host.clone()),
        Field::DstIp => Value::Str(
            metadata
                .dst_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
        ),
        Field::SrcIp => Value::Str(metadata.src_ip.to_string()),
        Field::DstPort => Value::Int(metadata.dst_port as i64),
        Field::SrcPort => Value::Int(metadata.src_port as i64),
        Field::ProcessName => Value::Str(metadata.process.clone().unwrap_or_default()),
    }
}

fn eval<'a>(
    expr: &'a Expr,
    metadata: &'a Metadata,
    env: &'a ScriptEnv,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        match expr {
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Field(field) => Ok(field_value(*field, metadata)),
            Expr::Not(inner) => {
                let value = eval(inner, metadata, env).await?;
                Ok(Value::Bool(!value.truthy()))
            }
            Expr::Binary(op, left, right) => {
                match op {
                    BinOp::And => {
                        let lhs = eval(left, metadata, env).await?;
                        if !lhs.truthy() {
                            return Ok(Value::Bool(false));
                        }
                        let rhs = eval(right, metadata, env).await?;
                        return Ok(Value::Bool(rhs.truthy()));
                    }
                    BinOp::Or => {
                        let lhs = eval(left, metadata, env).await?;
                        if lhs.truthy() {
                            return Ok(Value::Bool(true));
                        }
                        let rhs = eval(right, metadata, env).await?;
                        return Ok(Value::Bool(rhs.truthy()));
                    }
                    _ => {}
                }

                let lhs = eval(left, metadata, env).await?;
                let rhs = eval(right, metadata, env).await?;
                let result = match op {
                    BinOp::Eq => lhs.loose_eq(&rhs),
                    BinOp::Ne => !lhs.loose_eq(&rhs),
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        let (a, b) = match (lhs.as_int(), rhs.as_int()) {
                            (Some(a), Some(b)) => (a, b),
                            _ => {
                                return Err(Error::script(format!(
                                    "ordering needs integers in {}",
                                    expr_name(op)
                                )))
                            }
                        };
                        match op {
                            BinOp::Lt => a < b,
                            BinOp::Le => a <= b,
                            BinOp::Gt => a > b,
                            BinOp::Ge => a >= b,
                            _ => unreachable!(),
                        }
                    }
                    BinOp::And | BinOp::Or => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(eval(arg, metadata, env).await?);
                }
                call_helper(name, &values, metadata, env).await
            }
        }
    }
    .boxed()
}

fn expr_name(op: &BinOp) -> &'static str {
    match op {
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        _ => "comparison",
    }
}

fn str_arg(values: &[Value], index: usize, helper: &str) -> Result<String> {
    match values.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        other => Err(Error::script(format!(
            "{} argument {} must be a string, found {:?}",
            helper, index, other
        ))),
    }
}

/// Helper dispatch. I/O failures yield false/empty, never errors.
async fn call_helper(
    name: &str,
    args: &[Value],
    metadata: &Metadata,
    env: &ScriptEnv,
) -> Result<Value> {
    match name {
        "resolve_ip" => {
            let host = str_arg(args, 0, name)?;
            let ip = env
                .resolver
                .resolve_ip(&host)
                .await
                .map(|ip| ip.to_string())
                .unwrap_or_default();
            Ok(Value::Str(ip))
        }
        "geoip" => {
            let ip = str_arg(args, 0, name)?;
            let code = ip
                .parse::<IpAddr>()
                .ok()
                .and_then(|ip| env.geodata.geoip.lookup(ip))
                .unwrap_or_default();
            Ok(Value::Str(code))
        }
        "in_cidr" => {
            let ip = str_arg(args, 0, name)?;
            let cidr = str_arg(args, 1, name)?;
            let net: ipnet::IpNet = cidr
                .parse()
                .map_err(|e| Error::script(format!("in_cidr bad cidr {}: {}", cidr, e)))?;
            let hit = ip
                .parse::<IpAddr>()
                .map(|ip| net.contains(&ip))
                .unwrap_or(false);
            Ok(Value::Bool(hit))
        }
        "in_ipset" => {
            let set = str_arg(args, 0, name)?;
            let ip = str_arg(args, 1, name)?;
            let hit = ip
                .parse::<IpAddr>()
                .ok()
                .and_then(|ip| env.providers.match_ip(&set, ip))
                .unwrap_or(false);
            Ok(Value::Bool(hit))
        }
        "match_provider" => {
            let provider = str_arg(args, 0, name)?;
            let hit = env
                .providers
                .match_metadata(&provider, metadata)
                .unwrap_or(false);
            Ok(Value::Bool(hit))
        }
        "resolve_process_name" => Ok(Value::Str(metadata.process.clone().unwrap_or_default())),
        "resolve_process_path" => Ok(Value::Str(
            metadata.process_path.clone().unwrap_or_default(),
        )),
        other => Err(Error::script(format!("unknown helper: {}", other))),
    }
}

// ---------------------------------------------------------------------------
// Restricted main() interpreter

#[derive(Debug)]
enum Stmt {
    If {
        branches: Vec<(CompiledBranch, Vec<Stmt>)>,
        fallback: Vec<Stmt>,
    },
    Return(Expr),
}

#[derive(Debug)]
struct CompiledBranch {
    ast: Expr,
}

/// A compiled `def main(ctx, metadata):` program.
pub struct Script {
    body: Vec<Stmt>,
    referenced_providers: Vec<String>,
}

impl Script {
    pub fn compile(src: &str) -> Result<Self> {
        let mut lines: Vec<(usize, String)> = Vec::new();
        for raw in src.lines() {
            let without_comment = match raw.find('#') {
                Some(i) => &raw[..i],
                None => raw,
            };
            if without_comment.trim().is_empty() {
                continue;
            }
            let indent = without_comment.len() - without_comment.trim_start().len();
            lines.push((indent, without_comment.trim().to_string()));
        }

        let Some((_, header)) = lines.first() else {
            return Err(Error::script("empty script"));
        };
        let header_ok = header.starts_with("def main(")
            && header.ends_with("):")
            && header.contains("metadata");
        if !header_ok {
            return Err(Error::script(
                "script must define `def main(ctx, metadata):`",
            ));
        }

        let mut providers = Vec::new();
        let body_indent = lines
            .get(1)
            .map(|(indent, _)| *indent)
            .ok_or_else(|| Error::script("main body is empty"))?;
        let mut pos = 1;
        let body = parse_block(&lines, &mut pos, body_indent, &mut providers)?;
        if pos != lines.len() {
            return Err(Error::script("statements outside main are not allowed"));
        }

        Ok(Script {
            body,
            referenced_providers: providers,
        })
    }

    pub fn referenced_providers(&self) -> &[String] {
        &self.referenced_providers
    }

    /// Run `main` and return the chosen proxy name.
    pub async fn run_main(&self, metadata: &Metadata, env: &ScriptEnv) -> Result<String> {
        match run_block(&self.body, metadata, env).await? {
            Some(Value::Str(name)) => Ok(name),
            Some(other) => Err(Error::script(format!(
                "main must return a proxy name, returned {:?}",
                other
            ))),
            None => Err(Error::script("main returned nothing")),
        }
    }
}

fn compile_condition(src: &str, providers: &mut Vec<String>) -> Result<CompiledBranch> {
    let tokens = tokenize(src)?;
    let mut parser = Parser::new(tokens);
    let ast = parser.parse_expr()?;
    if parser.peek().is_some() {
        return Err(Error::script(format!("trailing tokens in condition: {}", src)));
    }
    providers.extend(parser.providers);
    Ok(CompiledBranch { ast })
}

fn compile_return(src: &str, providers: &mut Vec<String>) -> Result<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser::new(tokens);
    let ast = parser.parse_expr()?;
    if parser.peek().is_some() {
        return Err(Error::script(format!("trailing tokens in return: {}", src)));
    }
    providers.extend(parser.providers);
    Ok(ast)
}

fn parse_block(
    lines: &[(usize, String)],
    pos: &mut usize,
    indent: usize,
    providers: &mut Vec<String>,
) -> Result<Vec<Stmt>> {
    let mut stmts = Vec::new();

    while *pos < lines.len() {
        let (line_indent, line) = &lines[*pos];
        if *line_indent < indent {
            break;
        }
        if *line_indent > indent {
            return Err(Error::script(format!("unexpected indent: {}", line)));
        }

        if let Some(cond) = line.strip_prefix("if ").and_then(|r| r.strip_suffix(':')) {
            *pos += 1;
            let inner_indent = block_indent(lines, *pos, indent)?;
            let then_block = parse_block(lines, pos, inner_indent, providers)?;
            let mut branches = vec![(compile_condition(cond, providers)?, then_block)];
            let mut fallback = Vec::new();

            while *pos < lines.len() {
                let (next_indent, next_line) = &lines[*pos];
                if *next_indent != indent {
                    break;
                }
                if let Some(cond) = next_line
                    .strip_prefix("elif ")
                    .and_then(|r| r.strip_suffix(':'))
                {
                    *pos += 1;
                    let inner_indent = block_indent(lines, *pos, indent)?;
                    let block = parse_block(lines, pos, inner_indent, providers)?;
                    branches.push((compile_condition(cond, providers)?, block));
                } else if next_line == "else:" {
                    *pos += 1;
                    let inner_indent = block_indent(lines, *pos, indent)?;
                    fallback = parse_block(lines, pos, inner_indent, providers)?;
                    break;
                } else {
                    break;
                }
            }

            stmts.push(Stmt::If { branches, fallback });
        } else if let Some(expr) = line.strip_prefix("return ") {
            *pos += 1;
            stmts.push(Stmt::Return(compile_return(expr, providers)?));
        } else {
            return Err(Error::script(format!("unsupported statement: {}", line)));
        }
    }

    Ok(stmts)
}

fn block_indent(lines: &[(usize, String)], pos: usize, outer: usize) -> Result<usize> {
    match lines.get(pos) {
        Some((indent, _)) if *indent > outer => Ok(*indent),
        Some((_, line)) => Err(Error::script(format!("expected indented block before {}", line))),
        None => Err(Error::script("expected indented block at end of script")),
    }
}

fn run_block<'a>(
    stmts: &'a [Stmt],
    metadata: &'a Metadata,
    env: &'a ScriptEnv,
) -> BoxFuture<'a, Result<Option<Value>>> {
    async move {
        for stmt in stmts {
            match stmt {
                Stmt::Return(expr) => return Ok(Some(eval(expr, metadata, env).await?)),
                Stmt::If { branches, fallback } => {
                    let mut taken = false;
                    for (branch, block) in branches {
                        if eval(&branch.ast, metadata, env).await?.truthy() {
                            if let Some(value) = run_block(block, metadata, env).await? {
                                return Ok(Some(value));
                            }
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        if let Some(value) = run_block(fallback, metadata, env).await? {
                            return Ok(Some(value));
                        }
                    }
                }
            }
        }
        Ok(None)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SourceType;
    use crate::config::DnsConfig;
    use std::collections::HashMap;

    struct NoProviders;

    impl ProviderMatch for NoProviders {
        fn match_metadata(&self, name: &str, metadata: &Metadata) -> Option<bool> {
            if name == "ads" {
                Some(metadata.host.contains("ads"))
            } else {
                None
            }
        }

        fn match_ip(&self, _name: &str, _ip: IpAddr) -> Option<bool> {
            None
        }
    }

    fn env() -> ScriptEnv {
        ScriptEnv {
            resolver: Arc::new(
                Resolver::new(
                    &DnsConfig::default(),
                    &HashMap::new(),
                    Arc::new(GeoData::default()),
                    None,
                )
                .unwrap(),
            ),
            geodata: Arc::new(GeoData::default()),
            providers: Arc::new(NoProviders),
        }
    }

    fn meta(host: &str, port: u16) -> Metadata {
        Metadata::tcp(SourceType::Socks)
            .with_host(host)
            .with_dst_port(port)
    }

    #[tokio::test]
    async fn test_field_comparison() {
        let env = env();
        let expr = CompiledExpr::compile(r#"network == "tcp" and dst_port == 443"#).unwrap();
        assert!(expr.evaluate(&meta("x.com", 443), &env).await.unwrap());
        assert!(!expr.evaluate(&meta("x.com", 80), &env).await.unwrap());
    }

    #[tokio::test]
    async fn test_or_not_precedence() {
        let env = env();
        let expr =
            CompiledExpr::compile(r#"host == "a.com" or host == "b.com" and dst_port == 22"#)
                .unwrap();
        // `and` binds tighter than `or`
        assert!(expr.evaluate(&meta("a.com", 80), &env).await.unwrap());
        assert!(expr.evaluate(&meta("b.com", 22), &env).await.unwrap());
        assert!(!expr.evaluate(&meta("b.com", 80), &env).await.unwrap());

        let expr = CompiledExpr::compile(r#"not (dst_port == 22)"#).unwrap();
        assert!(expr.evaluate(&meta("a.com", 80), &env).await.unwrap());
    }

    #[tokio::test]
    async fn test_port_ordering() {
        let env = env();
        let expr = CompiledExpr::compile("dst_port >= 8000 and dst_port <= 9000").unwrap();
        assert!(expr.evaluate(&meta("x.com", 8443), &env).await.unwrap());
        assert!(!expr.evaluate(&meta("x.com", 443), &env).await.unwrap());
    }

    #[tokio::test]
    async fn test_match_provider_helper() {
        let env = env();
        let expr = CompiledExpr::compile(r#"match_provider("ads")"#).unwrap();
        assert_eq!(expr.referenced_providers(), &["ads".to_string()]);
        assert!(expr.evaluate(&meta("ads.tracker.com", 80), &env).await.unwrap());
        assert!(!expr.evaluate(&meta("clean.com", 80), &env).await.unwrap());

        // Unknown providers evaluate to false rather than erroring
        let expr = CompiledExpr::compile(r#"match_provider("missing")"#).unwrap();
        assert!(!expr.evaluate(&meta("x.com", 80), &env).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_cidr_helper() {
        let env = env();
        let expr = CompiledExpr::compile(r#"in_cidr(src_ip, "0.0.0.0/0")"#).unwrap();
        assert!(expr.evaluate(&meta("x.com", 80), &env).await.unwrap());
    }

    #[test]
    fn test_unknown_identifier_rejected() {
        assert!(CompiledExpr::compile("bogus_field == 1").is_err());
        assert!(CompiledExpr::compile("launch_missiles()").is_err());
    }

    #[test]
    fn test_ctx_chain_lowering() {
        let expr =
            CompiledExpr::compile(r#"ctx.rule_providers["streaming"].match(metadata)"#).unwrap();
        assert_eq!(expr.referenced_providers(), &["streaming".to_string()]);
    }

    #[tokio::test]
    async fn test_script_main() {
        let src = r#"
def main(ctx, metadata):
    if host == "example.com":
        return "ProxyA"
    elif dst_port == 22:
        return "SSH"
    else:
        return "DIRECT"
"#;
        let script = Script::compile(src).unwrap();
        let env = env();

        assert_eq!(
            script.run_main(&meta("example.com", 443), &env).await.unwrap(),
            "ProxyA"
        );
        assert_eq!(script.run_main(&meta("x.com", 22), &env).await.unwrap(), "SSH");
        assert_eq!(
            script.run_main(&meta("x.com", 80), &env).await.unwrap(),
            "DIRECT"
        );
    }

    #[tokio::test]
    async fn test_script_nested_if_falls_through() {
        let src = r#"
def main(ctx, metadata):
    if network == "tcp":
        if dst_port == 853:
            return "DNS"
    return "DIRECT"
"#;
        let script = Script::compile(src).unwrap();
        let env = env();
        assert_eq!(script.run_main(&meta("x.com", 853), &env).await.unwrap(), "DNS");
        assert_eq!(
            script.run_main(&meta("x.com", 80), &env).await.unwrap(),
            "DIRECT"
        );
    }

    #[test]
    fn test_script_requires_main() {
        assert!(Script::compile("return 1").is_err());
        assert!(Script::compile("def other():\n    return 'x'\n").is_err());
    }
}
