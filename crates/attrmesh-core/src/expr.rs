//! Expression compiler contracts
//!
//! Match conditions and instance fields are written as expressions over
//! attributes. The dispatch core does not care how the text is compiled; it
//! only consumes compiled expressions through these traits.

use crate::{
    Error, Result,
    attribute::{Bag, Value, ValueType},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A compiled expression that can be evaluated against an attribute bag
pub trait Expression: Send + Sync + fmt::Debug {
    /// Evaluate the expression and return its value
    fn evaluate(&self, bag: &dyn Bag) -> Result<Value>;

    /// Evaluate the expression as a boolean
    fn evaluate_boolean(&self, bag: &dyn Bag) -> Result<bool> {
        match self.evaluate(bag)? {
            Value::Bool(b) => Ok(b),
            other => Err(Error::Expression(format!(
                "expression did not evaluate to a boolean: got {}",
                other.value_type()
            ))),
        }
    }
}

/// Compiles expression text into an evaluator and reports its result type
pub trait ExpressionCompiler: Send + Sync {
    fn compile(&self, text: &str) -> Result<(Arc<dyn Expression>, ValueType)>;
}

/// Creates a compiler typed by a snapshot's attribute vocabulary
pub type CompilerFactory =
    Arc<dyn Fn(&AttributeManifest) -> Arc<dyn ExpressionCompiler> + Send + Sync>;

/// Declared attribute vocabulary, used to type-check expressions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeManifest {
    attributes: BTreeMap<String, ValueType>,
}

impl AttributeManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.insert(name, value_type);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value_type: ValueType) {
        self.attributes.insert(name.into(), value_type);
    }

    /// Look up the declared type of an attribute
    pub fn find(&self, name: &str) -> Option<ValueType> {
        self.attributes.get(name).copied()
    }

    /// Merge the declarations of `other` into this manifest
    pub fn extend(&mut self, other: &AttributeManifest) {
        for (name, vt) in &other.attributes {
            self.attributes.insert(name.clone(), *vt);
        }
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ValueType)> {
        self.attributes.iter()
    }
}
