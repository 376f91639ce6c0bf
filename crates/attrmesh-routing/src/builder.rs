//! Routing table construction
//!
//! Every failure while building is local: a bad match clause drops its rule,
//! a missing handler drops its action, a bad instance drops that instance.
//! Each is logged and counted, and the table is always returned.

use attrmesh_core::{
    Error, Result,
    config::{InstanceConfig, ResourceType, Rule, Snapshot},
    directory::{HandlerDirectory, HandlerEntry},
    expr::{AttributeManifest, Expression, ExpressionCompiler},
    attribute::ValueType,
    template::{InstanceBuilder, OutputMapper, Template, Variety},
};
use attrmesh_observability::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::table::{DebugInfo, Destination, InstanceGroup, NamespaceTable, RoutingTable, VarietyTable};

/// Build the routing table for a snapshot
///
/// When `debug_info` is set the table keeps match texts and instance names,
/// which show up in its `Display` output.
pub fn build_table(
    snapshot: &Snapshot,
    handlers: &dyn HandlerDirectory,
    compiler: &dyn ExpressionCompiler,
    default_namespace: &str,
    debug_info: bool,
    metrics: &Metrics,
) -> RoutingTable {
    let mut b = Builder {
        handlers,
        compiler,
        metrics,
        next_id: 1,
        drafts: Vec::new(),
        index: HashMap::new(),
        matches_by_id: HashMap::new(),
        instance_names_by_id: HashMap::new(),
        builders: HashMap::with_capacity(snapshot.instances.len()),
        mappers: HashMap::with_capacity(snapshot.instances.len()),
        expressions: HashMap::with_capacity(snapshot.rules.len()),
    };

    for rule in &snapshot.rules {
        b.add_rule(rule, &snapshot.attributes);
    }

    let mut table = RoutingTable::new(snapshot.id);
    table.entries = b.freeze(default_namespace);

    if debug_info {
        table.debug_info = Some(DebugInfo {
            matches_by_id: b.matches_by_id,
            instance_names_by_id: b.instance_names_by_id,
        });
    }

    table
}

/// Mutable destination record, frozen into a `Destination` once all rules
/// have been added
struct DestinationDraft {
    id: u32,
    entry: HandlerEntry,
    template: Arc<dyn Template>,
    groups: Vec<InstanceGroup>,
}

/// Where an instance lands in the table
struct Placement<'r> {
    namespace: &'r str,
    template: &'r Arc<dyn Template>,
    entry: &'r HandlerEntry,
    condition: Option<Arc<dyn Expression>>,
    builder: InstanceBuilder,
    mapper: Option<Arc<OutputMapper>>,
    instance_name: &'r str,
    match_text: &'r str,
    resource_type: ResourceType,
}

/// Ephemeral state while a table is built
struct Builder<'a> {
    handlers: &'a dyn HandlerDirectory,
    compiler: &'a dyn ExpressionCompiler,
    metrics: &'a Metrics,

    /// Ids for destinations and instance groups, referenced by debug info
    next_id: u32,

    /// Destination arena
    drafts: Vec<DestinationDraft>,
    /// Arena indices by variety, then namespace, in insertion order
    index: HashMap<Variety, HashMap<String, Vec<usize>>>,

    matches_by_id: HashMap<u32, String>,
    instance_names_by_id: HashMap<u32, Vec<String>>,

    /// Builders by instance name
    builders: HashMap<String, InstanceBuilder>,
    /// Mappers by instance name
    mappers: HashMap<String, Arc<OutputMapper>>,
    /// Compiled conditions by trimmed match text
    expressions: HashMap<String, Arc<dyn Expression>>,
}

fn same_condition(a: &Option<Arc<dyn Expression>>, b: &Option<Arc<dyn Expression>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
        _ => false,
    }
}

impl<'a> Builder<'a> {
    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn add_rule(&mut self, rule: &Rule, attributes: &AttributeManifest) {
        let condition = match self.condition_expression(rule) {
            Ok(condition) => condition,
            Err(e) => {
                warn!(
                    rule = %rule.name,
                    expression = %rule.match_text,
                    error = %e,
                    "Unable to compile match condition expression"
                );
                self.metrics.match_errors.inc();
                return;
            }
        };

        for (i, action) in rule.actions.iter().enumerate() {
            let handler_name = &action.handler.name;
            let Some(entry) = self.handlers.get(handler_name) else {
                // The config is consistent, but the handler failed to initialize.
                warn!(
                    rule = %rule.name,
                    action = i,
                    handler = %handler_name,
                    "Unable to find a handler for action"
                );
                self.metrics.unsatisfied_action_handlers.inc();
                continue;
            };

            for instance in &action.instances {
                let (builder, mapper) = match self.builder_and_mapper(attributes, instance) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(instance = %instance.name, error = %e, "Unable to create builder/mapper for instance");
                        self.metrics.instance_build_errors.inc();
                        continue;
                    }
                };

                self.add(Placement {
                    namespace: &rule.namespace,
                    template: &instance.template,
                    entry: &entry,
                    condition: condition.clone(),
                    builder,
                    mapper,
                    instance_name: &instance.name,
                    match_text: &rule.match_text,
                    resource_type: rule.resource_type,
                });
            }
        }
    }

    /// Get or compile the condition of a rule; `None` means always
    fn condition_expression(&mut self, rule: &Rule) -> Result<Option<Arc<dyn Expression>>> {
        let text = rule.match_text.trim();
        if text.is_empty() || text == "true" {
            return Ok(None);
        }

        if let Some(expression) = self.expressions.get(text) {
            return Ok(Some(Arc::clone(expression)));
        }

        let (expression, value_type) = self.compiler.compile(text)?;
        if value_type != ValueType::Bool {
            return Err(Error::Expression(format!(
                "expression does not return a boolean: '{}'",
                text
            )));
        }

        self.expressions.insert(text.to_string(), Arc::clone(&expression));
        Ok(Some(expression))
    }

    /// Get or create the builder of an instance, plus its mapper when the
    /// template is an attribute generator
    fn builder_and_mapper(
        &mut self,
        attributes: &AttributeManifest,
        instance: &InstanceConfig,
    ) -> Result<(InstanceBuilder, Option<Arc<OutputMapper>>)> {
        let template = &instance.template;

        let builder = match self.builders.get(&instance.name) {
            Some(builder) => Arc::clone(builder),
            None => {
                let builder =
                    template.create_instance_builder(&instance.name, &instance.params, self.compiler)?;
                self.builders.insert(instance.name.clone(), Arc::clone(&builder));
                builder
            }
        };

        if template.variety() != Variety::AttributeGenerator {
            return Ok((builder, None));
        }

        let mapper = match self.mappers.get(&instance.name) {
            Some(mapper) => Arc::clone(mapper),
            None => {
                let expressions =
                    template.create_output_expressions(&instance.params, attributes, self.compiler)?;
                let mapper = Arc::new(OutputMapper::new(expressions));
                self.mappers.insert(instance.name.clone(), Arc::clone(&mapper));
                mapper
            }
        };

        Ok((builder, Some(mapper)))
    }

    fn add(&mut self, p: Placement<'_>) {
        let variety = p.template.variety();
        let existing = self
            .index
            .get(&variety)
            .and_then(|by_ns| by_ns.get(p.namespace))
            .and_then(|slots| {
                // Namespaces hold few destinations; a scan is enough.
                slots.iter().copied().find(|&slot| {
                    let d = &self.drafts[slot];
                    d.entry.same_handler(&p.entry.handler) && d.template.name() == p.template.name()
                })
            });

        let slot = match existing {
            Some(slot) => slot,
            None => {
                let id = self.next_id();
                self.drafts.push(DestinationDraft {
                    id,
                    entry: p.entry.clone(),
                    template: Arc::clone(p.template),
                    groups: Vec::new(),
                });
                let slot = self.drafts.len() - 1;
                self.index
                    .entry(variety)
                    .or_default()
                    .entry(p.namespace.to_string())
                    .or_default()
                    .push(slot);
                slot
            }
        };

        let group_pos = self.drafts[slot]
            .groups
            .iter()
            .position(|g| same_condition(&g.condition, &p.condition) && g.resource_type == p.resource_type);

        let group_pos = match group_pos {
            Some(pos) => pos,
            None => {
                let id = self.next_id();
                if !p.match_text.is_empty() {
                    self.matches_by_id.insert(id, p.match_text.to_string());
                }
                self.instance_names_by_id.insert(id, Vec::with_capacity(1));

                let groups = &mut self.drafts[slot].groups;
                groups.push(InstanceGroup {
                    id,
                    condition: p.condition,
                    resource_type: p.resource_type,
                    builders: Vec::new(),
                    mappers: Vec::new(),
                });
                groups.len() - 1
            }
        };

        let group = &mut self.drafts[slot].groups[group_pos];
        group.builders.push(p.builder);
        if let Some(mapper) = p.mapper {
            group.mappers.push(mapper);
        }

        self.instance_names_by_id
            .entry(group.id)
            .or_default()
            .push(p.instance_name.to_string());
    }

    /// Freeze the arena into destinations and merge the default namespace
    /// into every other namespace, ahead of its own destinations
    fn freeze(&mut self, default_namespace: &str) -> HashMap<Variety, VarietyTable> {
        let metrics = self.metrics;
        let mut frozen: Vec<Option<Arc<Destination>>> = std::mem::take(&mut self.drafts)
            .into_iter()
            .map(|draft| {
                let max_instances = draft.groups.iter().map(|g| g.builders.len()).sum();
                let counters = metrics.destination_counters(
                    &draft.entry.name,
                    &draft.entry.adapter.name,
                    draft.template.name(),
                );
                Some(Arc::new(Destination {
                    id: draft.id,
                    handler: draft.entry.handler,
                    friendly_name: draft.entry.name.clone(),
                    handler_name: draft.entry.name,
                    adapter_name: draft.entry.adapter.name.clone(),
                    template: draft.template,
                    instance_groups: draft.groups,
                    max_instances,
                    counters,
                }))
            })
            .collect();

        let mut entries = HashMap::with_capacity(self.index.len());
        for (variety, by_namespace) in std::mem::take(&mut self.index) {
            let mut namespaces: HashMap<String, NamespaceTable> = by_namespace
                .into_iter()
                .map(|(namespace, slots)| {
                    let destinations = slots
                        .into_iter()
                        .filter_map(|slot| frozen.get_mut(slot).and_then(Option::take))
                        .collect();
                    (namespace, NamespaceTable { entries: destinations })
                })
                .collect();

            let default_set = match namespaces.get(default_namespace) {
                Some(set) => set.clone(),
                None => {
                    warn!(namespace = default_namespace, %variety, "No destination sets found for the default namespace");
                    NamespaceTable::default()
                }
            };

            if default_set.count() != 0 {
                for (namespace, set) in namespaces.iter_mut() {
                    if namespace == default_namespace {
                        continue;
                    }
                    let own = std::mem::take(&mut set.entries);
                    set.entries = default_set.entries.iter().cloned().chain(own).collect();
                }
            }

            debug!(%variety, namespaces = namespaces.len(), "Built variety table");
            entries.insert(
                variety,
                VarietyTable {
                    entries: namespaces,
                    default_set,
                },
            );
        }

        entries
    }
}
