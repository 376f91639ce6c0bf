//! Template contracts
//!
//! A template describes the shape of the instances a handler receives and the
//! variety of call they are dispatched through. Templates turn instance
//! parameters into an [`InstanceBuilder`] and, for attribute generators, into
//! the output expressions that map handler results back onto attributes.

use crate::{
    Error, Result,
    adapter::Instance,
    attribute::{Bag, MutableBag, Value},
    expr::{AttributeManifest, Expression, ExpressionCompiler},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Field of an attribute generator's params holding the output bindings
pub const ATTRIBUTE_BINDINGS: &str = "attribute_bindings";

/// Policy category of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variety {
    Check,
    Report,
    Quota,
    AttributeGenerator,
}

impl Variety {
    pub const ALL: [Variety; 4] = [
        Variety::Check,
        Variety::Report,
        Variety::Quota,
        Variety::AttributeGenerator,
    ];
}

impl fmt::Display for Variety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variety::Check => "TEMPLATE_VARIETY_CHECK",
            Variety::Report => "TEMPLATE_VARIETY_REPORT",
            Variety::Quota => "TEMPLATE_VARIETY_QUOTA",
            Variety::AttributeGenerator => "TEMPLATE_VARIETY_ATTRIBUTE_GENERATOR",
        };
        f.write_str(name)
    }
}

/// Builds an instance from a request's attributes
pub type InstanceBuilder = Arc<dyn Fn(&dyn Bag) -> Result<Instance> + Send + Sync>;

/// Maps the result bag of an attribute generator onto output attributes
#[derive(Debug, Clone, Default)]
pub struct OutputMapper {
    /// Target attribute and the expression producing it, sorted by target
    expressions: Vec<(String, Arc<dyn Expression>)>,
}

impl OutputMapper {
    pub fn new(expressions: HashMap<String, Arc<dyn Expression>>) -> Self {
        let mut expressions: Vec<_> = expressions.into_iter().collect();
        expressions.sort_by(|a, b| a.0.cmp(&b.0));
        Self { expressions }
    }

    /// Evaluate every output expression against the handler's result bag
    pub fn map(&self, result: &dyn Bag) -> Result<MutableBag> {
        let mut out = MutableBag::new();
        for (name, expr) in &self.expressions {
            let value = expr.evaluate(result)?;
            out.set(name.clone(), value);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }
}

/// A template known to the runtime
pub trait Template: Send + Sync {
    fn name(&self) -> &str;

    fn variety(&self) -> Variety;

    /// Compile the instance parameters into a builder
    fn create_instance_builder(
        &self,
        instance_name: &str,
        params: &serde_json::Value,
        compiler: &dyn ExpressionCompiler,
    ) -> Result<InstanceBuilder>;

    /// Compile the output expressions of an attribute generator
    fn create_output_expressions(
        &self,
        _params: &serde_json::Value,
        _manifest: &AttributeManifest,
        _compiler: &dyn ExpressionCompiler,
    ) -> Result<HashMap<String, Arc<dyn Expression>>> {
        Ok(HashMap::new())
    }
}

/// Field source of a [`DynamicTemplate`] instance
#[derive(Debug, Clone)]
enum FieldSource {
    Expression(Arc<dyn Expression>),
    Literal(Value),
}

/// A template whose instance fields are taken verbatim from the params
///
/// String params are compiled as expressions, other scalars become literals.
/// For attribute generators the `attribute_bindings` entry maps target
/// attributes to output expressions and is not part of the instance.
#[derive(Debug, Clone)]
pub struct DynamicTemplate {
    name: String,
    variety: Variety,
}

impl DynamicTemplate {
    pub fn new(name: impl Into<String>, variety: Variety) -> Self {
        Self {
            name: name.into(),
            variety,
        }
    }
}

fn params_object(
    params: &serde_json::Value,
) -> Result<Option<&serde_json::Map<String, serde_json::Value>>> {
    match params {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(map)),
        other => Err(Error::InstanceBuild(format!(
            "params must be a map, got: {}",
            other
        ))),
    }
}

impl Template for DynamicTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn variety(&self) -> Variety {
        self.variety
    }

    fn create_instance_builder(
        &self,
        instance_name: &str,
        params: &serde_json::Value,
        compiler: &dyn ExpressionCompiler,
    ) -> Result<InstanceBuilder> {
        let mut fields = Vec::new();
        if let Some(map) = params_object(params)? {
            for (field, raw) in map {
                if field == ATTRIBUTE_BINDINGS {
                    continue;
                }
                let source = match raw {
                    serde_json::Value::String(text) => {
                        let (expr, _) = compiler.compile(text).map_err(|e| {
                            Error::InstanceBuild(format!(
                                "instance='{}' field='{}': {}",
                                instance_name, field, e
                            ))
                        })?;
                        FieldSource::Expression(expr)
                    }
                    serde_json::Value::Bool(b) => FieldSource::Literal(Value::Bool(*b)),
                    serde_json::Value::Number(n) => match n.as_i64() {
                        Some(i) => FieldSource::Literal(Value::Int64(i)),
                        None => FieldSource::Literal(Value::Double(n.as_f64().unwrap_or_default())),
                    },
                    other => {
                        return Err(Error::InstanceBuild(format!(
                            "instance='{}' field='{}': unsupported value {}",
                            instance_name, field, other
                        )));
                    }
                };
                fields.push((field.clone(), source));
            }
        }

        let name = instance_name.to_string();
        let template = self.name.clone();
        Ok(Arc::new(move |bag: &dyn Bag| {
            let mut instance = Instance::new(name.clone(), template.clone());
            for (field, source) in &fields {
                let value = match source {
                    FieldSource::Expression(expr) => expr.evaluate(bag).map_err(|e| {
                        Error::InstanceBuild(format!(
                            "instance='{}' field='{}': {}",
                            name, field, e
                        ))
                    })?,
                    FieldSource::Literal(v) => v.clone(),
                };
                instance.fields.insert(field.clone(), value);
            }
            Ok(instance)
        }))
    }

    fn create_output_expressions(
        &self,
        params: &serde_json::Value,
        manifest: &AttributeManifest,
        compiler: &dyn ExpressionCompiler,
    ) -> Result<HashMap<String, Arc<dyn Expression>>> {
        let mut expressions = HashMap::new();
        let Some(bindings) = params_object(params)?.and_then(|m| m.get(ATTRIBUTE_BINDINGS)) else {
            return Ok(expressions);
        };
        let Some(bindings) = bindings.as_object() else {
            return Err(Error::InstanceBuild(format!(
                "{} must be a map",
                ATTRIBUTE_BINDINGS
            )));
        };

        for (target, raw) in bindings {
            if manifest.find(target).is_none() {
                return Err(Error::UnknownAttribute(target.clone()));
            }
            let text = raw.as_str().ok_or_else(|| {
                Error::InstanceBuild(format!("binding for '{}' is not an expression", target))
            })?;
            let (expr, _) = compiler.compile(text)?;
            expressions.insert(target.clone(), expr);
        }
        Ok(expressions)
    }
}

/// Known templates, keyed by name
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<dyn Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: Arc<dyn Template>) {
        self.templates.insert(template.name().to_string(), template);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Template>> {
        self.templates.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.templates.keys().collect();
        names.sort();
        f.debug_struct("TemplateRegistry")
            .field("templates", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::ValueType;

    /// Compiles bare attribute names into lookups
    struct LookupCompiler;

    #[derive(Debug)]
    struct Lookup(String);

    impl Expression for Lookup {
        fn evaluate(&self, bag: &dyn Bag) -> Result<Value> {
            bag.get(&self.0)
                .ok_or_else(|| Error::Expression(format!("lookup failed: '{}'", self.0)))
        }
    }

    impl ExpressionCompiler for LookupCompiler {
        fn compile(&self, text: &str) -> Result<(Arc<dyn Expression>, ValueType)> {
            Ok((Arc::new(Lookup(text.trim().to_string())), ValueType::String))
        }
    }

    #[test]
    fn test_instance_builder_without_params() {
        let tmpl = DynamicTemplate::new("tcheck", Variety::Check);
        let builder = tmpl
            .create_instance_builder("icheck1.tcheck.istio-system", &serde_json::Value::Null, &LookupCompiler)
            .unwrap();

        let instance = builder(&MutableBag::new()).unwrap();
        assert_eq!(instance.name, "icheck1.tcheck.istio-system");
        assert_eq!(instance.template, "tcheck");
        assert!(instance.fields.is_empty());
    }

    #[test]
    fn test_instance_builder_evaluates_fields() {
        let tmpl = DynamicTemplate::new("treport", Variety::Report);
        let params = serde_json::json!({"source": "src.name", "weight": 3});
        let builder = tmpl
            .create_instance_builder("i1", &params, &LookupCompiler)
            .unwrap();

        let bag: MutableBag = [("src.name", "client")].into_iter().collect();
        let instance = builder(&bag).unwrap();
        assert_eq!(instance.fields.get("source"), Some(&Value::from("client")));
        assert_eq!(instance.fields.get("weight"), Some(&Value::Int64(3)));

        let err = builder(&MutableBag::new()).unwrap_err();
        assert!(err.to_string().contains("field='source'"));
    }

    #[test]
    fn test_output_expressions_require_declared_targets() {
        let tmpl = DynamicTemplate::new("tapa", Variety::AttributeGenerator);
        let params = serde_json::json!({"attribute_bindings": {"source.user": "user"}});

        let empty = AttributeManifest::new();
        let err = tmpl
            .create_output_expressions(&params, &empty, &LookupCompiler)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAttribute(name) if name == "source.user"));

        let manifest = AttributeManifest::new().with_attribute("source.user", ValueType::String);
        let exprs = tmpl
            .create_output_expressions(&params, &manifest, &LookupCompiler)
            .unwrap();
        assert_eq!(exprs.len(), 1);
    }

    #[test]
    fn test_output_mapper_maps_result_bag() {
        let mut exprs: HashMap<String, Arc<dyn Expression>> = HashMap::new();
        exprs.insert("source.user".to_string(), Arc::new(Lookup("user".to_string())));
        let mapper = OutputMapper::new(exprs);

        let result: MutableBag = [("user", "alice")].into_iter().collect();
        let out = mapper.map(&result).unwrap();
        assert_eq!(out.get("source.user"), Some(Value::from("alice")));

        assert!(mapper.map(&MutableBag::new()).is_err());
    }

    #[test]
    fn test_variety_display() {
        assert_eq!(Variety::Check.to_string(), "TEMPLATE_VARIETY_CHECK");
        assert_eq!(
            Variety::AttributeGenerator.to_string(),
            "TEMPLATE_VARIETY_ATTRIBUTE_GENERATOR"
        );
    }
}
