//! Filter-expression evaluation for the in-memory backend
//!
//! Parses the native filter grammar once per query and evaluates it against
//! stored items, the way the managed store does server side:
//!
//! ```text
//! expr    := or
//! or      := and ("OR" and)*
//! and     := unary ("AND" unary)*
//! unary   := "NOT" unary | primary
//! primary := "(" expr ")"
//!          | "contains" "(" operand "," operand ")"
//!          | "attribute_exists" "(" path ")"
//!          | "attribute_not_exists" "(" path ")"
//!          | operand "=" operand
//!          | operand "IN" "(" operand ("," operand)* ")"
//! operand := path | ":value"
//! path    := segment ("." segment)*        segment := name | "#alias"
//! ```

use std::collections::BTreeMap;

use serde_json::Value;

use super::FilterExpression;
use crate::error::{AuditError, AuditResult};
use crate::types::Item;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Eq,
    Word(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(Vec<String>),
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Equals(Operand, Operand),
    In(Operand, Vec<Operand>),
    Contains(Operand, Operand),
    Exists(Vec<String>),
    NotExists(Vec<String>),
}

/// A parsed filter expression with its placeholders resolved
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    root: Node,
}

impl Condition {
    /// Parse and bind a filter expression
    pub fn parse(filter: &FilterExpression) -> AuditResult<Self> {
        let tokens = tokenize(&filter.expression)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            names: &filter.names,
            values: &filter.values,
        };
        let root = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected trailing token {:?}", token)));
        }
        Ok(Self { root })
    }

    /// Whether the item satisfies the expression
    pub fn matches(&self, item: &Item) -> bool {
        eval(&self.root, item)
    }
}

fn invalid(message: String) -> AuditError {
    AuditError::BadParameter(format!("invalid filter expression: {}", message))
}

fn tokenize(input: &str) -> AuditResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            ':' => {
                chars.next();
                let name = take_word(&mut chars);
                if name.is_empty() {
                    return Err(invalid("empty value placeholder".to_string()));
                }
                tokens.push(Token::Placeholder(format!(":{}", name)));
            }
            c if is_word_char(c) => {
                tokens.push(Token::Word(take_word(&mut chars)));
            }
            other => return Err(invalid(format!("unexpected character {:?}", other))),
        }
    }
    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '#' | '.' | '-')
}

fn take_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if !is_word_char(c) {
            break;
        }
        word.push(c);
        chars.next();
    }
    word
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    names: &'a BTreeMap<String, String>,
    values: &'a BTreeMap<String, Value>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, expected: Token) -> AuditResult<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(invalid(format!("expected {:?}, found {:?}", expected, other))),
        }
    }

    fn parse_or(&mut self) -> AuditResult<Node> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("OR") {
            self.next();
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> AuditResult<Node> {
        let mut left = self.parse_unary()?;
        while self.peek_keyword("AND") {
            self.next();
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> AuditResult<Node> {
        if self.peek_keyword("NOT") {
            self.next();
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> AuditResult<Node> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let node = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(node);
        }

        let function = match (self.peek(), self.tokens.get(self.pos + 1)) {
            (Some(Token::Word(w)), Some(Token::LParen)) => Some(w.to_ascii_lowercase()),
            _ => None,
        };
        if let Some(function) = function {
            self.pos += 2;
            let node = match function.as_str() {
                "contains" => {
                    let haystack = self.parse_operand()?;
                    self.expect(Token::Comma)?;
                    let needle = self.parse_operand()?;
                    Node::Contains(haystack, needle)
                }
                "attribute_exists" => Node::Exists(self.parse_path()?),
                "attribute_not_exists" => Node::NotExists(self.parse_path()?),
                other => return Err(invalid(format!("unknown function {}", other))),
            };
            self.expect(Token::RParen)?;
            return Ok(node);
        }

        let left = self.parse_operand()?;
        if self.peek() == Some(&Token::Eq) {
            self.next();
            let right = self.parse_operand()?;
            return Ok(Node::Equals(left, right));
        }
        if self.peek_keyword("IN") {
            self.next();
            self.expect(Token::LParen)?;
            let mut list = vec![self.parse_operand()?];
            while self.peek() == Some(&Token::Comma) {
                self.next();
                list.push(self.parse_operand()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Node::In(left, list));
        }
        Err(invalid(format!("expected comparison, found {:?}", self.peek())))
    }

    fn parse_operand(&mut self) -> AuditResult<Operand> {
        match self.next() {
            Some(Token::Placeholder(name)) => match self.values.get(&name) {
                Some(value) => Ok(Operand::Value(value.clone())),
                None => Err(invalid(format!("unbound value placeholder {}", name))),
            },
            Some(Token::Word(word)) => Ok(Operand::Path(self.resolve_path(&word)?)),
            other => Err(invalid(format!("expected operand, found {:?}", other))),
        }
    }

    fn parse_path(&mut self) -> AuditResult<Vec<String>> {
        match self.next() {
            Some(Token::Word(word)) => self.resolve_path(&word),
            other => Err(invalid(format!("expected attribute path, found {:?}", other))),
        }
    }

    fn resolve_path(&self, word: &str) -> AuditResult<Vec<String>> {
        word.split('.')
            .map(|segment| {
                if segment.is_empty() {
                    Err(invalid(format!("empty segment in path {}", word)))
                } else if segment.starts_with('#') {
                    self.names
                        .get(segment)
                        .cloned()
                        .ok_or_else(|| invalid(format!("unbound name placeholder {}", segment)))
                } else {
                    Ok(segment.to_string())
                }
            })
            .collect()
    }
}

fn lookup<'v>(item: &'v Item, path: &[String]) -> Option<&'v Value> {
    let (first, rest) = path.split_first()?;
    let mut value = item.get(first)?;
    for segment in rest {
        value = value.as_object()?.get(segment)?;
    }
    Some(value)
}

fn resolve<'v>(operand: &'v Operand, item: &'v Item) -> Option<&'v Value> {
    match operand {
        Operand::Path(path) => lookup(item, path),
        Operand::Value(value) => Some(value),
    }
}

fn eval(node: &Node, item: &Item) -> bool {
    match node {
        Node::And(left, right) => eval(left, item) && eval(right, item),
        Node::Or(left, right) => eval(left, item) || eval(right, item),
        Node::Not(inner) => !eval(inner, item),
        Node::Equals(left, right) => match (resolve(left, item), resolve(right, item)) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        },
        Node::In(operand, list) => match resolve(operand, item) {
            Some(value) => list.iter().any(|c| resolve(c, item) == Some(value)),
            None => false,
        },
        Node::Contains(haystack, needle) => {
            match (resolve(haystack, item), resolve(needle, item)) {
                (Some(Value::String(s)), Some(Value::String(n))) => s.contains(n.as_str()),
                (Some(Value::Array(values)), Some(n)) => values.contains(n),
                _ => false,
            }
        }
        Node::Exists(path) => lookup(item, path).is_some(),
        Node::NotExists(path) => lookup(item, path).is_none(),
    }
}
