//! Minimal expression language for fixtures
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := cmp ("&&" cmp)*
//! cmp     := primary (("==" | "!=") primary)?
//! primary := "string" | integer | true | false | "(" expr ")"
//!          | match(primary, primary) | attribute | $out.attribute
//! ```
//!
//! Attributes are typed by the manifest. `$out.<name>` reads the result bag
//! of an attribute generator and is typed as a string. A `match` pattern may
//! start or end with `*`.

use attrmesh_core::{
    Error, Result,
    attribute::{Bag, Value, ValueType},
    expr::{AttributeManifest, Expression, ExpressionCompiler},
};
use std::sync::Arc;

const OUT_PREFIX: &str = "$out.";

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Attribute(String),
    Equal(Box<Node>, Box<Node>),
    NotEqual(Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Match(Box<Node>, Box<Node>),
}

#[derive(Debug)]
struct Compiled {
    #[allow(dead_code)]
    text: String,
    root: Node,
}

fn glob_match(value: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        value.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        value.ends_with(suffix)
    } else {
        value == pattern
    }
}

impl Node {
    fn eval(&self, bag: &dyn Bag) -> Result<Value> {
        match self {
            Node::Literal(v) => Ok(v.clone()),
            Node::Attribute(name) => bag
                .get(name)
                .ok_or_else(|| Error::Expression(format!("lookup failed: '{}'", name))),
            Node::Equal(a, b) => Ok(Value::Bool(a.eval(bag)? == b.eval(bag)?)),
            Node::NotEqual(a, b) => Ok(Value::Bool(a.eval(bag)? != b.eval(bag)?)),
            Node::And(a, b) => Ok(Value::Bool(a.eval_bool(bag)? && b.eval_bool(bag)?)),
            Node::Or(a, b) => Ok(Value::Bool(a.eval_bool(bag)? || b.eval_bool(bag)?)),
            Node::Match(value, pattern) => {
                let value = value.eval(bag)?;
                let pattern = pattern.eval(bag)?;
                match (value.as_str(), pattern.as_str()) {
                    (Some(v), Some(p)) => Ok(Value::Bool(glob_match(v, p))),
                    _ => Err(Error::Expression("match() expects strings".to_string())),
                }
            }
        }
    }

    fn eval_bool(&self, bag: &dyn Bag) -> Result<bool> {
        self.eval(bag)?
            .as_bool()
            .ok_or_else(|| Error::Expression("operand is not a boolean".to_string()))
    }
}

impl Expression for Compiled {
    fn evaluate(&self, bag: &dyn Bag) -> Result<Value> {
        self.root.eval(bag)
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    manifest: &'a AttributeManifest,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> Error {
        Error::Expression(format!("{} at {} in '{}'", msg, self.pos, self.text))
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", token)))
        }
    }

    fn parse(mut self) -> Result<(Node, ValueType)> {
        let node = self.or()?;
        self.skip_ws();
        if !self.rest().is_empty() {
            return Err(self.error("unexpected input"));
        }
        Ok(node)
    }

    fn boolean_operands(&self, a: ValueType, b: ValueType) -> Result<()> {
        if a == ValueType::Bool && b == ValueType::Bool {
            Ok(())
        } else {
            Err(self.error("logical operands must be booleans"))
        }
    }

    fn or(&mut self) -> Result<(Node, ValueType)> {
        let (mut node, mut vt) = self.and()?;
        while self.eat("||") {
            let (rhs, rvt) = self.and()?;
            self.boolean_operands(vt, rvt)?;
            node = Node::Or(Box::new(node), Box::new(rhs));
            vt = ValueType::Bool;
        }
        Ok((node, vt))
    }

    fn and(&mut self) -> Result<(Node, ValueType)> {
        let (mut node, mut vt) = self.comparison()?;
        while self.eat("&&") {
            let (rhs, rvt) = self.comparison()?;
            self.boolean_operands(vt, rvt)?;
            node = Node::And(Box::new(node), Box::new(rhs));
            vt = ValueType::Bool;
        }
        Ok((node, vt))
    }

    fn comparison(&mut self) -> Result<(Node, ValueType)> {
        let (lhs, vt) = self.primary()?;
        if self.eat("==") {
            let (rhs, _) = self.primary()?;
            return Ok((Node::Equal(Box::new(lhs), Box::new(rhs)), ValueType::Bool));
        }
        if self.eat("!=") {
            let (rhs, _) = self.primary()?;
            return Ok((Node::NotEqual(Box::new(lhs), Box::new(rhs)), ValueType::Bool));
        }
        Ok((lhs, vt))
    }

    fn primary(&mut self) -> Result<(Node, ValueType)> {
        self.skip_ws();

        if self.eat("(") {
            let inner = self.or()?;
            self.expect(")")?;
            return Ok(inner);
        }

        if self.rest().starts_with('"') {
            let body = &self.rest()[1..];
            let Some(end) = body.find('"') else {
                return Err(self.error("unterminated string"));
            };
            let literal = body[..end].to_string();
            self.pos += end + 2;
            return Ok((Node::Literal(Value::String(literal)), ValueType::String));
        }

        let digits = self
            .rest()
            .find(|c: char| !(c.is_ascii_digit() || c == '-'))
            .unwrap_or(self.rest().len());
        if digits > 0 {
            let token = &self.rest()[..digits];
            let n: i64 = token.parse().map_err(|_| self.error("invalid integer"))?;
            self.pos += digits;
            return Ok((Node::Literal(Value::Int64(n)), ValueType::Int64));
        }

        let len = self
            .rest()
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$'))
            .unwrap_or(self.rest().len());
        if len == 0 {
            return Err(self.error("expected an operand"));
        }
        let ident = &self.rest()[..len];
        self.pos += len;

        match ident {
            "true" => Ok((Node::Literal(Value::Bool(true)), ValueType::Bool)),
            "false" => Ok((Node::Literal(Value::Bool(false)), ValueType::Bool)),
            "match" => {
                self.expect("(")?;
                let (value, _) = self.primary()?;
                self.expect(",")?;
                let (pattern, _) = self.primary()?;
                self.expect(")")?;
                Ok((Node::Match(Box::new(value), Box::new(pattern)), ValueType::Bool))
            }
            _ => {
                if let Some(name) = ident.strip_prefix(OUT_PREFIX) {
                    return Ok((Node::Attribute(name.to_string()), ValueType::String));
                }
                match self.manifest.find(ident) {
                    Some(vt) => Ok((Node::Attribute(ident.to_string()), vt)),
                    None => Err(Error::UnknownAttribute(ident.to_string())),
                }
            }
        }
    }
}

/// Compiles the fixture expression language against an attribute manifest
#[derive(Debug, Clone, Default)]
pub struct TestExpressionCompiler {
    manifest: AttributeManifest,
}

impl TestExpressionCompiler {
    pub fn new(manifest: AttributeManifest) -> Self {
        Self { manifest }
    }
}

impl ExpressionCompiler for TestExpressionCompiler {
    fn compile(&self, text: &str) -> Result<(Arc<dyn Expression>, ValueType)> {
        let parser = Parser {
            text,
            pos: 0,
            manifest: &self.manifest,
        };
        let (root, vt) = parser.parse()?;
        Ok((
            Arc::new(Compiled {
                text: text.to_string(),
                root,
            }),
            vt,
        ))
    }
}
