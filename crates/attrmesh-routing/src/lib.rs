//! attrmesh Routing
//!
//! Builds the immutable routing table the dispatcher resolves requests
//! against. The table is laid out for dispatch-time lookups:
//!
//! ```text
//! RoutingTable:   variety   -> VarietyTable
//! VarietyTable:   namespace -> NamespaceTable
//! NamespaceTable: [Destination]
//! Destination:    unique (handler, template) + [InstanceGroup]
//! InstanceGroup:  condition + [InstanceBuilder] + [OutputMapper]
//! ```
//!
//! A namespace table also carries every destination of the default
//! namespace, ahead of its own. Namespaces without rules resolve to the default
//! namespace's destinations.

pub mod builder;
pub mod table;

pub use builder::build_table;
pub use table::{Destination, InstanceGroup, NamespaceTable, RoutingTable, VarietyTable};
