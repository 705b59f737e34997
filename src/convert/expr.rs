//! Restricted expressions for exact-JSON fields.
//!
//! The grammar covers literals, the document variable `x`, member and index
//! access, arithmetic, comparisons and boolean logic. There are no calls,
//! assignments or loops, so evaluating an expression cannot run arbitrary
//! code.

use serde_json::{Number, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("parse error at {pos}: {reason}")]
    Parse { pos: usize, reason: String },
    #[error("unknown variable `{0}`, only `x` is defined")]
    UnknownVariable(String),
    #[error("function calls are not allowed")]
    CallNotAllowed,
    #[error("cannot apply `{op}` to {left} and {right}")]
    Type {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '0'..='9' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| ExprError::Parse {
                    pos: start,
                    reason: format!("bad number `{text}`"),
                })?;
                out.push((start, Token::Num(num)));
                continue;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExprError::Parse {
                                pos: start,
                                reason: "unterminated string".to_string(),
                            });
                        }
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                text.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                out.push((start, Token::Str(text)));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                out.push((start, Token::Ident(chars[start..i].iter().collect())));
                continue;
            }
            '(' => out.push((start, Token::LParen)),
            ')' => out.push((start, Token::RParen)),
            '[' => out.push((start, Token::LBracket)),
            ']' => out.push((start, Token::RBracket)),
            '.' => out.push((start, Token::Dot)),
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    // tolerate `===` and `!==`
                    i += 2;
                    if matches!(op, "==" | "!=") && chars.get(i) == Some(&'=') {
                        i += 1;
                    }
                    out.push((start, Token::Op(op)));
                    continue;
                }
                let op = match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '%' => "%",
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    other => {
                        return Err(ExprError::Parse {
                            pos: start,
                            reason: format!("unexpected `{other}`"),
                        });
                    }
                };
                out.push((start, Token::Op(op)));
            }
        }
        i += 1;
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Doc,
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Unary(&'static str, Box<Node>),
    Binary(&'static str, Box<Node>, Box<Node>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn error(&self, reason: impl Into<String>) -> ExprError {
        ExprError::Parse {
            pos: self.offset(),
            reason: reason.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn binary(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> Result<Node, ExprError>,
    ) -> Result<Node, ExprError> {
        let mut left = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let right = next(self)?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Node, ExprError> {
        self.binary(&["||"], Self::and)
    }

    fn and(&mut self) -> Result<Node, ExprError> {
        self.binary(&["&&"], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Node, ExprError> {
        self.binary(&["==", "!=", "<", "<=", ">", ">="], Self::additive)
    }

    fn additive(&mut self) -> Result<Node, ExprError> {
        self.binary(&["+", "-"], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Node, ExprError> {
        self.binary(&["*", "/", "%"], Self::unary)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if let Some(op) = self.eat_op(&["!", "-"]) {
            return Ok(Node::Unary(op, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => node = Node::Member(Box::new(node), name),
                        _ => return Err(self.error("expected a field name after `.`")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.or()?;
                    if self.next() != Some(Token::RBracket) {
                        return Err(self.error("expected `]`"));
                    }
                    node = Node::Index(Box::new(node), Box::new(index));
                }
                Some(Token::LParen) => return Err(ExprError::CallNotAllowed),
                _ => return Ok(node),
            }
        }
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Node::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "x" => Ok(Node::Doc),
                "true" => Ok(Node::Literal(Value::Bool(true))),
                "false" => Ok(Node::Literal(Value::Bool(false))),
                "null" => Ok(Node::Literal(Value::Null)),
                _ => Err(ExprError::UnknownVariable(name)),
            },
            Some(Token::LParen) => {
                let inner = self.or()?;
                if self.next() != Some(Token::RParen) {
                    return Err(self.error("expected `)`"));
                }
                Ok(inner)
            }
            Some(other) => {
                self.pos -= 1;
                Err(self.error(format!("unexpected {other:?}")))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// A parsed expression, evaluated against a document bound to `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let root = parser.or()?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, doc: &Value) -> Result<Value, ExprError> {
        eval(&self.root, doc)
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn eval(node: &Node, doc: &Value) -> Result<Value, ExprError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Doc => Ok(doc.clone()),
        Node::Member(target, name) => Ok(eval(target, doc)?
            .get(name.as_str())
            .cloned()
            .unwrap_or(Value::Null)),
        Node::Index(target, index) => {
            let target = eval(target, doc)?;
            let index = eval(index, doc)?;
            let found = match &index {
                Value::Number(n) => n
                    .as_u64()
                    .and_then(|i| target.get(i as usize))
                    .cloned(),
                Value::String(key) => target.get(key.as_str()).cloned(),
                _ => None,
            };
            Ok(found.unwrap_or(Value::Null))
        }
        Node::Unary("!", inner) => Ok(Value::Bool(!truthy(&eval(inner, doc)?))),
        Node::Unary(op, inner) => {
            let v = eval(inner, doc)?;
            match v.as_f64() {
                Some(f) => Ok(number(-f)),
                None => Err(ExprError::Type {
                    op,
                    left: kind(&v),
                    right: kind(&v),
                }),
            }
        }
        Node::Binary("&&", l, r) => {
            Ok(Value::Bool(truthy(&eval(l, doc)?) && truthy(&eval(r, doc)?)))
        }
        Node::Binary("||", l, r) => {
            Ok(Value::Bool(truthy(&eval(l, doc)?) || truthy(&eval(r, doc)?)))
        }
        Node::Binary(op, l, r) => {
            let left = eval(l, doc)?;
            let right = eval(r, doc)?;
            binary(op, &left, &right)
        }
    }
}

fn binary(op: &'static str, left: &Value, right: &Value) -> Result<Value, ExprError> {
    let type_error = || ExprError::Type {
        op,
        left: kind(left),
        right: kind(right),
    };
    match op {
        "==" => return Ok(Value::Bool(loosely_equal(left, right))),
        "!=" => return Ok(Value::Bool(!loosely_equal(left, right))),
        "+" if left.is_string() || right.is_string() => {
            return Ok(Value::String(text(left) + &text(right)));
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
        let result = match op {
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            _ => return Err(type_error()),
        };
        return Ok(Value::Bool(result));
    }

    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(type_error());
    };
    let value = match op {
        "+" => number(a + b),
        "-" => number(a - b),
        "*" => number(a * b),
        "/" => number(a / b),
        "%" => number(a % b),
        "<" => Value::Bool(a < b),
        "<=" => Value::Bool(a <= b),
        ">" => Value::Bool(a > b),
        ">=" => Value::Bool(a >= b),
        _ => return Err(type_error()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_str(src: &str, doc: &Value) -> Value {
        Expr::parse(src).unwrap().eval(doc).unwrap()
    }

    #[test]
    fn arithmetic_and_precedence() {
        let doc = json!({"a": 2, "b": {"c": 3.5}});
        assert_eq!(eval_str("x.a + x.b.c * 2", &doc), json!(9));
        assert_eq!(eval_str("(x.a + 1) * 2", &doc), json!(6));
        assert_eq!(eval_str("-x.a % 3", &doc), json!(-2));
        assert_eq!(eval_str("x.b.c / 2", &doc), json!(1.75));
    }

    #[test]
    fn comparisons_and_logic() {
        let doc = json!({"temp": 30, "unit": "C", "tags": ["a", "b"]});
        assert_eq!(eval_str("x.temp > 25 && x.unit == 'C'", &doc), json!(true));
        assert_eq!(eval_str("x.temp <= 25 || !x.unit", &doc), json!(false));
        assert_eq!(eval_str("x.tags[1] === \"b\"", &doc), json!(true));
        assert_eq!(eval_str("x['unit'] + x.temp", &doc), json!("C30"));
    }

    #[test]
    fn missing_members_are_null() {
        let doc = json!({});
        assert_eq!(eval_str("x.nope.deeper", &doc), Value::Null);
        assert_eq!(eval_str("x.nope == null", &doc), json!(true));
    }

    #[test]
    fn refuses_calls_and_foreign_variables() {
        assert_eq!(Expr::parse("x.a()"), Err(ExprError::CallNotAllowed));
        assert_eq!(
            Expr::parse("process.exit"),
            Err(ExprError::UnknownVariable("process".to_string()))
        );
        assert!(matches!(Expr::parse("x.a +"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("x = 1"), Err(ExprError::Parse { .. })));
    }

    #[test]
    fn arithmetic_on_non_numbers_is_a_type_error() {
        let doc = json!({"a": true, "o": {}});
        assert!(matches!(
            Expr::parse("x.o * 2").unwrap().eval(&doc),
            Err(ExprError::Type { op: "*", .. })
        ));
    }
}
