//! Routing table data model

use attrmesh_core::{
    adapter::Handler,
    attribute::Bag,
    config::ResourceType,
    expr::Expression,
    template::{InstanceBuilder, OutputMapper, Template, Variety},
};
use attrmesh_observability::DestinationCounters;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};

static EMPTY_DESTINATIONS: NamespaceTable = NamespaceTable {
    entries: Vec::new(),
};

/// Immutable index of destinations, queried by variety then namespace
///
/// The only mutable state is the reference count of in-flight dispatches.
pub struct RoutingTable {
    /// Id of the snapshot the table was built from; -1 for the empty table
    pub(crate) id: i64,
    pub(crate) entries: HashMap<Variety, VarietyTable>,
    refs: AtomicI32,
    pub(crate) debug_info: Option<DebugInfo>,
}

/// Destinations of one variety, grouped by namespace
#[derive(Debug, Default)]
pub struct VarietyTable {
    /// Per-namespace destinations, default namespace destinations included
    pub(crate) entries: HashMap<String, NamespaceTable>,
    /// Destinations of the default namespace
    pub(crate) default_set: NamespaceTable,
}

/// Ordered destinations of a namespace
#[derive(Debug, Default, Clone)]
pub struct NamespaceTable {
    pub(crate) entries: Vec<Arc<Destination>>,
}

/// One (handler, template) pair within a namespace
pub struct Destination {
    pub(crate) id: u32,
    pub handler: Arc<dyn Handler>,
    /// Fully-qualified handler name
    pub handler_name: String,
    pub adapter_name: String,
    pub template: Arc<dyn Template>,
    /// Groups of instances applied to the handler, each behind a condition
    pub instance_groups: Vec<InstanceGroup>,
    pub(crate) max_instances: usize,
    /// Name used when reporting results of this destination
    pub friendly_name: String,
    pub counters: DestinationCounters,
}

/// Instance builders sharing one applicability condition
pub struct InstanceGroup {
    pub(crate) id: u32,
    /// `None` always applies
    pub condition: Option<Arc<dyn Expression>>,
    pub resource_type: ResourceType,
    pub builders: Vec<InstanceBuilder>,
    /// Output mappers, index-aligned with `builders`; empty unless the
    /// template is an attribute generator
    pub mappers: Vec<Arc<OutputMapper>>,
}

#[derive(Debug, Default)]
pub(crate) struct DebugInfo {
    /// Match clause text by instance group id
    pub(crate) matches_by_id: HashMap<u32, String>,
    /// Instance names by instance group id
    pub(crate) instance_names_by_id: HashMap<u32, Vec<String>>,
}

impl RoutingTable {
    pub(crate) fn new(id: i64) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            refs: AtomicI32::new(0),
            debug_info: None,
        }
    }

    /// Table with id -1 and no destinations
    pub fn empty() -> Self {
        Self::new(-1)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Destinations to dispatch to for a variety and namespace
    ///
    /// An unknown variety yields no destinations; an unknown namespace yields
    /// the default namespace's destinations.
    pub fn get_destinations(&self, variety: Variety, namespace: &str) -> &NamespaceTable {
        let Some(destinations) = self.entries.get(&variety) else {
            debug!(table = self.id, %variety, "No destinations found for variety");
            return &EMPTY_DESTINATIONS;
        };

        match destinations.entries.get(namespace) {
            Some(set) => set,
            None => {
                debug!(table = self.id, %variety, namespace, "No rules for namespace, using defaults");
                &destinations.default_set
            }
        }
    }

    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of dispatches currently using the table
    pub fn get_refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl NamespaceTable {
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Arc<Destination>] {
        &self.entries
    }
}

impl Destination {
    /// Upper bound on the instances one dispatch can build
    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl InstanceGroup {
    /// Whether the group applies to the given attributes
    ///
    /// An evaluation error counts as a non-match.
    pub fn matches(&self, bag: &dyn Bag) -> bool {
        let Some(condition) = &self.condition else {
            return true;
        };

        match condition.evaluate_boolean(bag) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(id = self.id, error = %e, "Instance group condition evaluation error");
                false
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("handler_name", &self.handler_name)
            .field("adapter_name", &self.adapter_name)
            .field("template", &self.template.name())
            .field("instance_groups", &self.instance_groups)
            .field("max_instances", &self.max_instances)
            .finish()
    }
}

impl fmt::Debug for InstanceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceGroup")
            .field("id", &self.id)
            .field("condition", &self.condition)
            .field("resource_type", &self.resource_type)
            .field("builders", &self.builders.len())
            .field("mappers", &self.mappers.len())
            .finish()
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("id", &self.id)
            .field("entries", &self.entries)
            .field("refs", &self.get_refs())
            .finish()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Routing Table]")?;
        writeln!(f, "ID: {}", self.id)?;

        let mut varieties: Vec<_> = self.entries.iter().collect();
        varieties.sort_by_key(|(v, _)| **v);

        for (vi, (variety, vtable)) in varieties.into_iter().enumerate() {
            writeln!(f, "[#{}] {} {{V}}", vi, variety)?;

            let mut namespaces: Vec<_> = vtable.entries.iter().collect();
            namespaces.sort_by(|a, b| a.0.cmp(b.0));

            for (ni, (namespace, set)) in namespaces.into_iter().enumerate() {
                writeln!(f, "  [#{}] {} {{NS}}", ni, namespace)?;

                for (di, destination) in set.entries.iter().enumerate() {
                    writeln!(f, "    [#{}] {} {{H}}", di, destination.handler_name)?;

                    for (gi, group) in destination.instance_groups.iter().enumerate() {
                        writeln!(f, "      [#{}]", gi)?;
                        match self.debug_info.as_ref().and_then(|d| d.matches_by_id.get(&group.id)) {
                            Some(text) => writeln!(f, "        Condition: {}", text)?,
                            None if group.condition.is_some() => {
                                writeln!(f, "        Condition: <compiled>")?
                            }
                            None => writeln!(f, "        Condition: <NONE>")?,
                        }

                        let names = self
                            .debug_info
                            .as_ref()
                            .and_then(|d| d.instance_names_by_id.get(&group.id));
                        for (ii, _) in group.builders.iter().enumerate() {
                            let name = names
                                .and_then(|n| n.get(ii))
                                .map(String::as_str)
                                .unwrap_or("<unknown>");
                            writeln!(f, "        [#{}] {} {{I}}", ii, name)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table() {
        let table = RoutingTable::empty();
        assert_eq!(table.id(), -1);
        for variety in Variety::ALL {
            assert_eq!(table.get_destinations(variety, "istio-system").count(), 0);
        }
    }

    #[test]
    fn test_ref_counting() {
        let table = RoutingTable::empty();
        assert_eq!(table.get_refs(), 0);
        table.inc_ref();
        table.inc_ref();
        assert_eq!(table.get_refs(), 2);
        table.dec_ref();
        table.dec_ref();
        assert_eq!(table.get_refs(), 0);
    }

    #[test]
    fn test_display_empty() {
        let rendered = RoutingTable::new(7).to_string();
        assert!(rendered.starts_with("[Routing Table]\nID: 7\n"));
    }
}
