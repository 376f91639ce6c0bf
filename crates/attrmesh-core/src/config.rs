//! Configuration documents and resolved snapshots
//!
//! A [`ConfigDocument`] is the on-disk shape of the configuration. Resolving it
//! against the known templates and adapters yields a [`Snapshot`], the
//! immutable, cross-referenced view that handler tables and routing tables are
//! built from.

use crate::{
    adapter::{AdapterInfo, AdapterRegistry},
    expr::AttributeManifest,
    template::{Template, TemplateRegistry},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Namespace used when a config entry does not name one
pub const DEFAULT_NAMESPACE: &str = "istio-system";

/// Kind segment used in fully-qualified rule names
pub const RULE_KIND: &str = "rule";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Request protocol a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
}

/// Resource-type restriction of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceType {
    pub protocol: Protocol,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// Configuration file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDocument {
    /// Attribute vocabulary
    pub attributes: AttributeManifest,
    pub handlers: Vec<HandlerSpec>,
    pub instances: Vec<InstanceSpec>,
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub name: String,
    /// Name of the adapter that builds this handler
    pub adapter: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    /// Name of the template the instance is built for
    pub template: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Match clause; empty means always
    #[serde(default, rename = "match")]
    pub match_text: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Handler reference, either `<name>.<adapter>` or fully-qualified
    pub handler: String,
    /// Instance references, either `<name>.<template>` or fully-qualified
    #[serde(default)]
    pub instances: Vec<String>,
}

/// Whether a reference is already of the form `<name>.<kind>.<namespace>`
pub fn is_fqn(name: &str) -> bool {
    name.split('.').count() == 3
}

/// Qualify a reference with the namespace of the entry that uses it
pub fn canonicalize(name: &str, namespace: &str) -> String {
    if is_fqn(name) {
        name.to_string()
    } else {
        format!("{}.{}", name, namespace)
    }
}

fn fqn(name: &str, kind: &str, namespace: &str) -> String {
    format!("{}.{}.{}", name, kind, namespace)
}

/// A resolved handler configuration
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Fully-qualified name, `<name>.<adapter>.<namespace>`
    pub name: String,
    pub adapter: Arc<AdapterInfo>,
    pub params: serde_json::Value,
}

/// A resolved instance configuration
#[derive(Clone)]
pub struct InstanceConfig {
    /// Fully-qualified name, `<name>.<template>.<namespace>`
    pub name: String,
    pub template: Arc<dyn Template>,
    pub params: serde_json::Value,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("name", &self.name)
            .field("template", &self.template.name())
            .field("params", &self.params)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Action {
    pub handler: Arc<HandlerConfig>,
    pub instances: Vec<Arc<InstanceConfig>>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Fully-qualified name, `<name>.rule.<namespace>`
    pub name: String,
    pub namespace: String,
    pub match_text: String,
    pub resource_type: ResourceType,
    pub actions: Vec<Action>,
}

/// Immutable, resolved view of one configuration generation
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub id: i64,
    pub attributes: AttributeManifest,
    pub handlers: BTreeMap<String, Arc<HandlerConfig>>,
    pub instances: BTreeMap<String, Arc<InstanceConfig>>,
    pub rules: Vec<Rule>,
    templates: Vec<String>,
    adapters: Vec<String>,
}

impl Snapshot {
    /// Snapshot with no configuration and id -1
    pub fn empty() -> Self {
        Self {
            id: -1,
            ..Default::default()
        }
    }

    /// Resolve a document against the known templates and adapters
    ///
    /// Entries referring to unknown templates, adapters, handlers or instances
    /// are logged and left out; resolution itself never fails.
    pub fn resolve(
        id: i64,
        doc: &ConfigDocument,
        templates: &TemplateRegistry,
        adapters: &AdapterRegistry,
    ) -> Self {
        let mut handlers = BTreeMap::new();
        for spec in &doc.handlers {
            let Some(adapter) = adapters.get(&spec.adapter) else {
                warn!(handler = %spec.name, adapter = %spec.adapter, "Unknown adapter, skipping handler");
                continue;
            };
            let name = fqn(&spec.name, &spec.adapter, &spec.namespace);
            handlers.insert(
                name.clone(),
                Arc::new(HandlerConfig {
                    name,
                    adapter,
                    params: spec.params.clone(),
                }),
            );
        }

        let mut instances = BTreeMap::new();
        for spec in &doc.instances {
            let Some(template) = templates.get(&spec.template) else {
                warn!(instance = %spec.name, template = %spec.template, "Unknown template, skipping instance");
                continue;
            };
            let name = fqn(&spec.name, &spec.template, &spec.namespace);
            instances.insert(
                name.clone(),
                Arc::new(InstanceConfig {
                    name,
                    template,
                    params: spec.params.clone(),
                }),
            );
        }

        let mut rules = Vec::with_capacity(doc.rules.len());
        for spec in &doc.rules {
            let rule_name = fqn(&spec.name, RULE_KIND, &spec.namespace);
            let mut actions = Vec::with_capacity(spec.actions.len());

            for action in &spec.actions {
                let handler_name = canonicalize(&action.handler, &spec.namespace);
                let Some(handler) = handlers.get(&handler_name) else {
                    warn!(rule = %rule_name, handler = %handler_name, "Rule refers to an unknown handler, skipping action");
                    continue;
                };

                let mut action_instances = Vec::with_capacity(action.instances.len());
                for reference in &action.instances {
                    let instance_name = canonicalize(reference, &spec.namespace);
                    let Some(instance) = instances.get(&instance_name) else {
                        warn!(rule = %rule_name, instance = %instance_name, "Rule refers to an unknown instance, skipping");
                        continue;
                    };
                    if !handler.adapter.supports(instance.template.name()) {
                        warn!(
                            rule = %rule_name,
                            handler = %handler_name,
                            template = %instance.template.name(),
                            "Handler does not support the instance template, skipping"
                        );
                        continue;
                    }
                    action_instances.push(Arc::clone(instance));
                }

                if action_instances.is_empty() {
                    debug!(rule = %rule_name, handler = %handler_name, "Action has no usable instances");
                    continue;
                }

                actions.push(Action {
                    handler: Arc::clone(handler),
                    instances: action_instances,
                });
            }

            rules.push(Rule {
                name: rule_name,
                namespace: spec.namespace.clone(),
                match_text: spec.match_text.clone(),
                resource_type: ResourceType {
                    protocol: spec.protocol,
                },
                actions,
            });
        }

        let mut template_names: Vec<String> = doc
            .instances
            .iter()
            .filter(|i| templates.get(&i.template).is_some())
            .map(|i| i.template.clone())
            .collect();
        template_names.sort();
        template_names.dedup();

        Self {
            id,
            attributes: doc.attributes.clone(),
            handlers,
            instances,
            rules,
            templates: template_names,
            adapters: adapters.names(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ID: {}", self.id)?;
        writeln!(f, "Templates:")?;
        for name in &self.templates {
            writeln!(f, "  Name: {}", name)?;
        }
        writeln!(f, "Adapters:")?;
        for name in &self.adapters {
            writeln!(f, "  Name: {}", name)?;
        }
        writeln!(f, "Handlers:")?;
        for (name, handler) in &self.handlers {
            writeln!(f, "  Name:    {}", name)?;
            writeln!(f, "  Adapter: {}", handler.adapter.name)?;
            writeln!(f, "  Params:  {}", handler.params)?;
        }
        writeln!(f, "Instances:")?;
        for (name, instance) in &self.instances {
            writeln!(f, "  Name:     {}", name)?;
            writeln!(f, "  Template: {}", instance.template.name())?;
            writeln!(f, "  Params:   {}", instance.params)?;
        }
        writeln!(f, "Rules:")?;
        for rule in &self.rules {
            writeln!(f, "  Name:         {}", rule.name)?;
            writeln!(f, "  Namespace:    {}", rule.namespace)?;
            writeln!(f, "  Match:        {}", rule.match_text)?;
            writeln!(f, "  ResourceType: {}", rule.resource_type)?;
            writeln!(f, "  Actions:")?;
            for action in &rule.actions {
                writeln!(f, "    Handler: {}", action.handler.name)?;
                writeln!(f, "    Instances:")?;
                for instance in &action.instances {
                    writeln!(f, "      Name: {}", instance.name)?;
                }
            }
        }
        writeln!(f, "Attributes:")?;
        for (name, vt) in self.attributes.iter() {
            writeln!(f, "  {}: {}", name, vt)?;
        }
        Ok(())
    }
}
