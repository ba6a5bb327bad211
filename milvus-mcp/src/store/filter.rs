//! Boolean filter expressions for the local store
//!
//! Supports the subset of the Milvus expression language that tools
//! commonly send:
//!
//! - literals: integers, floats, `"strings"` / `'strings'`, `true`/`false`, `[lists]`
//! - fields, with JSON access: `meta["color"]`, `tags[0]`
//! - comparison: `== != < <= > >=`, chained ranges (`1 < age <= 5`)
//! - membership: `in`, `not in`
//! - patterns: `like "pre%"` (`%` any run, `_` one character)
//! - logic: `and`/`&&`, `or`/`||`, `not`/`!`, parentheses
//!
//! Keywords are case-insensitive. An empty expression matches every row.

use crate::error::{Error, Result};
use crate::search::Row;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Field access path segment
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Field(String, Vec<Segment>),
    List(Vec<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    In {
        value: Box<Expr>,
        list: Box<Expr>,
        negated: bool,
    },
    Like(Box<Expr>, Regex),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    In,
    Like,
    True,
    False,
}

/// A parsed filter expression
#[derive(Debug, Clone)]
pub struct Filter {
    expr: Option<Expr>,
}

impl Filter {
    /// Parse an expression; blank input yields a filter matching everything
    pub fn parse(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Filter { expr: None });
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            source_len: source.len(),
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some((_, offset)) = parser.tokens.get(parser.pos) {
            return Err(syntax_error(*offset, "unexpected trailing input"));
        }
        Ok(Filter { expr: Some(expr) })
    }

    /// Parse an optional expression
    pub fn parse_opt(source: Option<&str>) -> Result<Self> {
        Self::parse(source.unwrap_or(""))
    }

    /// Whether the filter accepts every row
    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    /// Evaluate against a row
    pub fn matches(&self, row: &Row) -> bool {
        match &self.expr {
            None => true,
            Some(expr) => truthy(expr, row),
        }
    }
}

fn syntax_error(offset: usize, message: &str) -> Error {
    Error::backend(format!(
        "cannot parse filter expression at position {}: {}",
        offset, message
    ))
}

// -------------------------------------------------------------------------
// Tokenizer
// -------------------------------------------------------------------------

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('=', Some('=')) => (Token::Cmp(CmpOp::Eq), 2),
            ('!', Some('=')) => (Token::Cmp(CmpOp::Ne), 2),
            ('<', Some('=')) => (Token::Cmp(CmpOp::Le), 2),
            ('>', Some('=')) => (Token::Cmp(CmpOp::Ge), 2),
            ('<', _) => (Token::Cmp(CmpOp::Lt), 1),
            ('>', _) => (Token::Cmp(CmpOp::Gt), 1),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('!', _) => (Token::Not, 1),
            ('"', _) | ('\'', _) => {
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    match chars[j].1 {
                        '\\' if j + 1 < chars.len() => {
                            value.push(chars[j + 1].1);
                            j += 2;
                        }
                        q if q == c => {
                            closed = true;
                            break;
                        }
                        other => {
                            value.push(other);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(syntax_error(offset, "unterminated string literal"));
                }
                (Token::Str(value), j + 1 - i)
            }
            (c, _) if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].1.is_ascii_digit()
                        || matches!(chars[j].1, '.' | 'e' | 'E')
                        || (matches!(chars[j].1, '-' | '+')
                            && matches!(chars[j - 1].1, 'e' | 'E')))
                {
                    j += 1;
                }
                let text: String = chars[i..j].iter().map(|(_, c)| *c).collect();
                let token = if text.contains(['.', 'e', 'E']) {
                    text.parse::<f64>()
                        .map(Token::Float)
                        .map_err(|_| syntax_error(offset, "invalid number"))?
                } else {
                    text.parse::<i64>()
                        .map(Token::Int)
                        .map_err(|_| syntax_error(offset, "invalid integer"))?
                };
                (token, j - i)
            }
            (c, _) if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_alphanumeric() || matches!(chars[j].1, '_' | '$')) {
                    j += 1;
                }
                let word: String = chars[i..j].iter().map(|(_, c)| *c).collect();
                let token = match word.to_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "like" => Token::Like,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                };
                (token, j - i)
            }
            _ => {
                return Err(syntax_error(
                    offset,
                    &format!("unexpected character '{}'", c),
                ))
            }
        };

        tokens.push((token, offset));
        i += width;
    }

    Ok(tokens)
}

// -------------------------------------------------------------------------
// Parser
// -------------------------------------------------------------------------

/// Deepest nesting of parentheses, lists and `not` a filter may use
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    source_len: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, o)| *o)
            .unwrap_or(self.source_len)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        let offset = self.offset();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(syntax_error(offset, &format!("expected {}", what))),
        }
    }

    /// Run `f` one nesting level deeper
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_DEPTH {
            return Err(syntax_error(self.offset(), "expression nested too deeply"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;

        match self.peek().cloned() {
            Some(Token::Cmp(op)) => {
                self.advance();
                let right = self.parse_operand()?;
                let mut expr = Expr::Compare(Box::new(left), op, Box::new(right.clone()));
                // range form: a < field < b
                if let Some(Token::Cmp(op2)) = self.peek().cloned() {
                    self.advance();
                    let upper = self.parse_operand()?;
                    let second = Expr::Compare(Box::new(right), op2, Box::new(upper));
                    expr = Expr::And(vec![expr, second]);
                }
                Ok(expr)
            }
            Some(Token::In) => {
                self.advance();
                let list = self.parse_operand()?;
                Ok(Expr::In {
                    value: Box::new(left),
                    list: Box::new(list),
                    negated: false,
                })
            }
            Some(Token::Not)
                if matches!(self.tokens.get(self.pos + 1), Some((Token::In, _))) =>
            {
                self.pos += 2;
                let list = self.parse_operand()?;
                Ok(Expr::In {
                    value: Box::new(left),
                    list: Box::new(list),
                    negated: true,
                })
            }
            Some(Token::Like) => {
                self.advance();
                let offset = self.offset();
                match self.advance() {
                    Some(Token::Str(pattern)) => {
                        let regex = like_to_regex(&pattern)
                            .map_err(|_| syntax_error(offset, "invalid like pattern"))?;
                        Ok(Expr::Like(Box::new(left), regex))
                    }
                    _ => Err(syntax_error(offset, "like expects a string pattern")),
                }
            }
            _ => Ok(left),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::from(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::from(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::LParen) => self.nested(|p| {
                let inner = p.parse_or()?;
                p.expect(Token::RParen, "')'")?;
                Ok(inner)
            }),
            Some(Token::LBracket) => self.nested(|p| {
                let mut items = Vec::new();
                if p.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(p.parse_operand()?);
                        if p.peek() == Some(&Token::Comma) {
                            p.advance();
                            continue;
                        }
                        break;
                    }
                }
                p.expect(Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }),
            Some(Token::Ident(name)) => {
                let mut path = Vec::new();
                while self.peek() == Some(&Token::LBracket) {
                    self.advance();
                    let offset = self.offset();
                    match self.advance() {
                        Some(Token::Str(key)) => path.push(Segment::Key(key)),
                        Some(Token::Int(i)) if i >= 0 => path.push(Segment::Index(i as usize)),
                        _ => return Err(syntax_error(offset, "expected a key or index")),
                    }
                    self.expect(Token::RBracket, "']'")?;
                }
                Ok(Expr::Field(name, path))
            }
            Some(_) => Err(syntax_error(offset, "expected a value or field")),
            None => Err(syntax_error(offset, "unexpected end of expression")),
        }
    }
}

fn like_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

// -------------------------------------------------------------------------
// Evaluation
// -------------------------------------------------------------------------

fn value(expr: &Expr, row: &Row) -> Option<Value> {
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::Field(name, path) => {
            let mut current = row.get(name)?;
            for segment in path {
                current = match segment {
                    Segment::Key(key) => current.get(key.as_str())?,
                    Segment::Index(i) => current.get(*i)?,
                };
            }
            Some(current.clone())
        }
        Expr::List(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| value(item, row).unwrap_or(Value::Null))
                .collect(),
        )),
        _ => Some(Value::Bool(truthy(expr, row))),
    }
}

fn truthy(expr: &Expr, row: &Row) -> bool {
    match expr {
        Expr::And(terms) => terms.iter().all(|term| truthy(term, row)),
        Expr::Or(terms) => terms.iter().any(|term| truthy(term, row)),
        Expr::Not(inner) => !truthy(inner, row),
        Expr::Compare(a, op, b) => match (value(a, row), value(b, row)) {
            (Some(left), Some(right)) => compare(&left, *op, &right),
            _ => false,
        },
        Expr::In {
            value: item,
            list,
            negated,
        } => {
            let found = match (value(item, row), value(list, row)) {
                (Some(item), Some(Value::Array(items))) => items.iter().any(|v| loose_eq(&item, v)),
                _ => return false,
            };
            found != *negated
        }
        Expr::Like(item, regex) => match value(item, row) {
            Some(Value::String(s)) => regex.is_match(&s),
            _ => false,
        },
        Expr::Literal(Value::Bool(b)) => *b,
        Expr::Field(..) => matches!(value(expr, row), Some(Value::Bool(true))),
        _ => false,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            match (left.as_f64(), right.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, _) | (_, Value::Null) => None,
        _ => {
            return match op {
                CmpOp::Eq => left == right,
                CmpOp::Ne => left != right,
                _ => false,
            }
        }
    };

    match ordering {
        Some(ordering) => match op {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn matches(filter: &str, value: Value) -> bool {
        Filter::parse(filter).unwrap().matches(&row(value))
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = Filter::parse("  ").unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&row(json!({"id": 1}))));
    }

    #[test]
    fn test_comparisons() {
        let doc = json!({"id": 3, "score": 0.5, "title": "rust"});
        assert!(matches("id == 3", doc.clone()));
        assert!(matches("id != 4", doc.clone()));
        assert!(matches("score >= 0.5", doc.clone()));
        assert!(matches("score < 1", doc.clone()));
        assert!(matches("title == \"rust\"", doc.clone()));
        assert!(matches("title == 'rust'", doc.clone()));
        assert!(!matches("id > 3", doc.clone()));
        assert!(!matches("missing == 1", doc));
    }

    #[test]
    fn test_range_and_logic() {
        let doc = json!({"age": 30, "active": true});
        assert!(matches("18 <= age < 65", doc.clone()));
        assert!(!matches("31 <= age < 65", doc.clone()));
        assert!(matches("age > 10 and active", doc.clone()));
        assert!(matches("age > 100 || active == true", doc.clone()));
        assert!(matches("not (age > 100)", doc.clone()));
        assert!(matches("!(age > 100) AND age < 40", doc));
    }

    #[test]
    fn test_in_and_not_in() {
        let doc = json!({"id": 2, "color": "red"});
        assert!(matches("id in [1, 2, 3]", doc.clone()));
        assert!(matches("color not in ['blue', 'green']", doc.clone()));
        assert!(!matches("color in []", doc));
    }

    #[test]
    fn test_like() {
        let doc = json!({"name": "milvus-lite"});
        assert!(matches("name like \"milvus%\"", doc.clone()));
        assert!(matches("name like \"%lite\"", doc.clone()));
        assert!(matches("name like \"milvus_lite\"", doc.clone()));
        assert!(!matches("name like \"lite%\"", doc));
    }

    #[test]
    fn test_json_paths() {
        let doc = json!({"meta": {"color": "blue", "sizes": [8, 9]}});
        assert!(matches("meta[\"color\"] == \"blue\"", doc.clone()));
        assert!(matches("meta['sizes'][1] == 9", doc.clone()));
        assert!(!matches("meta[\"shape\"] == \"round\"", doc));
    }

    #[test]
    fn test_negative_numbers() {
        assert!(matches("delta > -2.5", json!({"delta": -1})));
        assert!(matches("delta == -3", json!({"delta": -3})));
    }

    #[test]
    fn test_parse_errors_name_position() {
        let err = Filter::parse("id == ").unwrap_err();
        assert!(err.to_string().contains("position 6"));

        let err = Filter::parse("id = 3").unwrap_err();
        assert!(err.to_string().contains("position 3"));

        assert!(Filter::parse("(id == 3").is_err());
        assert!(Filter::parse("name == 'open").is_err());
        assert!(Filter::parse("id == 3 3").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let deep = format!("{}id > 0{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = Filter::parse(&deep).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));

        let nots = format!("{}id > 0", "not ".repeat(10_000));
        assert!(Filter::parse(&nots).is_err());

        let lists = format!("id in {}1{}", "[".repeat(10_000), "]".repeat(10_000));
        assert!(Filter::parse(&lists).is_err());

        let shallow = format!("{}id > 0{}", "(".repeat(100), ")".repeat(100));
        assert!(matches(&shallow, json!({"id": 1})));
    }

    #[test]
    fn test_long_chains_stay_flat() {
        let any = (0..20_000)
            .map(|i| format!("id == {}", i))
            .collect::<Vec<_>>()
            .join(" or ");
        assert!(matches(&any, json!({"id": 19_999})));
        assert!(!matches(&any, json!({"id": 20_000})));

        let all = vec!["id > 0"; 20_000].join(" and ");
        assert!(matches(&all, json!({"id": 1})));
    }
}
