//! Condition expressions for `conditional_step`.
//!
//! ```text
//! json("/results/run/pkg/1.0.0/out.json", "stats.functions") > 0 && !exists("/tmp/skip")
//! ```
//!
//! Operators: `||`/`or`, `&&`/`and`, `!`/`not`, `== != < <= > >=` and
//! parentheses. Operands are numbers, quoted strings, `true`/`false`,
//! barewords (taken as strings) and function calls. Two operands that both
//! read as numbers are compared numerically, anything else as text.

use benchman_core::{BenchError, Result};
use serde_json::Value as JsonValue;
use std::path::Path;

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    root: Expr,
}

impl Condition {
    /// Parse `source`.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.or()?;
        if let Some(tok) = parser.peek() {
            return Err(invalid(format!("unexpected `{tok:?}` in `{source}`")));
        }
        Ok(Self { root })
    }

    /// Evaluate against the filesystem.
    pub fn evaluate(&self) -> Result<bool> {
        Ok(self.root.eval()?.truthy())
    }
}

/// Parse and evaluate `source`.
pub fn evaluate(source: &str) -> Result<bool> {
    Condition::parse(source)?.evaluate()
}

fn invalid(reason: impl Into<String>) -> BenchError {
    BenchError::invalid_param("conditional_step", "condition", reason)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Or,
    And,
    Not,
    Cmp(CmpOp),
    Num(f64),
    Str(String),
    Word(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            (c, _) if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('|', Some('|')) => (Token::Or, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('=', Some('=')) => (Token::Cmp(CmpOp::Eq), 2),
            ('!', Some('=')) => (Token::Cmp(CmpOp::Ne), 2),
            ('<', Some('=')) => (Token::Cmp(CmpOp::Le), 2),
            ('>', Some('=')) => (Token::Cmp(CmpOp::Ge), 2),
            ('<', _) => (Token::Cmp(CmpOp::Lt), 1),
            ('>', _) => (Token::Cmp(CmpOp::Gt), 1),
            ('!', _) => (Token::Not, 1),
            ('"' | '\'', _) => {
                let (s, width) = quoted(&chars[i..])?;
                (Token::Str(s), width)
            }
            _ => {
                let start = i;
                let mut end = i;
                while end < chars.len() && !is_delimiter(chars[end]) {
                    end += 1;
                }
                if end == start {
                    return Err(invalid(format!("unexpected `{c}` in `{source}`")));
                }
                let word: String = chars[start..end].iter().collect();
                (classify(word), end - start)
            }
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | ',' | '"' | '\'' | '=' | '!' | '<' | '>' | '&' | '|')
}

fn classify(word: String) -> Token {
    match word.as_str() {
        "or" => Token::Or,
        "and" => Token::And,
        "not" => Token::Not,
        _ => match word.parse::<f64>() {
            Ok(n) if n.is_finite() => Token::Num(n),
            _ => Token::Word(word),
        },
    }
}

/// Quoted string starting at `chars[0]`; returns the content and consumed width.
fn quoted(chars: &[char]) -> Result<(String, usize)> {
    let quote = chars[0];
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push(chars[i + 1]);
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(invalid("unterminated string"))
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Lit(Val),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
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
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            other => Err(invalid(format!("expected `{want:?}`, found `{other:?}`"))),
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = Expr::And(Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.primary()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Num(n)) => Ok(Expr::Lit(Val::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Val::Str(s))),
            Some(Token::Word(w)) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call(w, args))
            }
            Some(Token::Word(w)) => Ok(Expr::Lit(match w.as_str() {
                "true" | "True" => Val::Bool(true),
                "false" | "False" => Val::Bool(false),
                _ => Val::Str(w),
            })),
            other => Err(invalid(format!("expected an operand, found `{other:?}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Val {
    fn truthy(&self) -> bool {
        match self {
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0,
            Val::Str(s) => !s.is_empty(),
        }
    }

    fn as_num(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            Val::Str(s) => s.trim().parse().ok(),
            Val::Bool(_) => None,
        }
    }

    fn text(&self) -> String {
        match self {
            Val::Bool(b) => b.to_string(),
            Val::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Val::Num(n) => n.to_string(),
            Val::Str(s) => s.clone(),
        }
    }

    fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Bool(b) => Val::Bool(*b),
            JsonValue::Number(n) => n.as_f64().map(Val::Num).unwrap_or_else(|| Val::Str(n.to_string())),
            JsonValue::String(s) => Val::Str(s.clone()),
            JsonValue::Null => Val::Str(String::new()),
            other => Val::Str(other.to_string()),
        }
    }
}

impl Expr {
    fn eval(&self) -> Result<Val> {
        Ok(match self {
            Expr::Lit(v) => v.clone(),
            Expr::Not(e) => Val::Bool(!e.eval()?.truthy()),
            Expr::And(a, b) => Val::Bool(a.eval()?.truthy() && b.eval()?.truthy()),
            Expr::Or(a, b) => Val::Bool(a.eval()?.truthy() || b.eval()?.truthy()),
            Expr::Cmp(op, a, b) => Val::Bool(compare(*op, &a.eval()?, &b.eval()?)),
            Expr::Call(name, args) => {
                let args = args.iter().map(Expr::eval).collect::<Result<Vec<_>>>()?;
                call(name, &args)?
            }
        })
    }
}

fn compare(op: CmpOp, a: &Val, b: &Val) -> bool {
    use std::cmp::Ordering;

    let ordering = match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(a.text().cmp(&b.text())),
    };
    match (op, ordering) {
        (CmpOp::Eq, o) => o == Some(Ordering::Equal),
        (CmpOp::Ne, o) => o != Some(Ordering::Equal),
        (_, None) => false,
        (CmpOp::Lt, Some(o)) => o == Ordering::Less,
        (CmpOp::Le, Some(o)) => o != Ordering::Greater,
        (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
        (CmpOp::Ge, Some(o)) => o != Ordering::Less,
    }
}

fn call(name: &str, args: &[Val]) -> Result<Val> {
    let arg = |i: usize| -> Result<String> {
        args.get(i)
            .map(Val::text)
            .ok_or_else(|| invalid(format!("{name}() expects at least {} argument(s)", i + 1)))
    };
    Ok(match name {
        "exists" => Val::Bool(Path::new(&arg(0)?).exists()),
        "is_file" => Val::Bool(Path::new(&arg(0)?).is_file()),
        "is_dir" => Val::Bool(Path::new(&arg(0)?).is_dir()),
        "read" => Val::Str(
            std::fs::read_to_string(arg(0)?)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        ),
        "lines" => Val::Num(
            std::fs::read_to_string(arg(0)?)
                .map(|s| s.lines().count() as f64)
                .unwrap_or(0.0),
        ),
        "json" => {
            let path = if args.len() > 1 { arg(1)? } else { String::new() };
            std::fs::read_to_string(arg(0)?)
                .ok()
                .and_then(|text| serde_json::from_str::<JsonValue>(&text).ok())
                .and_then(|doc| navigate(&doc, &path).map(Val::from_json))
                .unwrap_or(Val::Str(String::new()))
        }
        "contains" => Val::Bool(arg(0)?.contains(&arg(1)?)),
        _ => return Err(invalid(format!("unknown function `{name}`"))),
    })
}

/// Follow a dotted path with optional indices (`a.b[0].c`).
fn navigate<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = doc;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (key, indices) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices.split('[').filter(|s| !s.is_empty()) {
            let index: usize = index.trim_end_matches(']').parse().ok()?;
            current = current.get(index)?;
        }
    }
    Some(current)
}
