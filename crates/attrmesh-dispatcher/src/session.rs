//! Per-call dispatch context

use attrmesh_core::{
    Error, Result,
    adapter::QuotaArgs,
    attribute::{Bag, Value},
    template::Variety,
};

/// Identity of one dispatch call, shared by all of its attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Sequence number of the call within its dispatcher
    pub id: u64,
    pub variety: Variety,
    /// Routing namespace derived from the identity attribute
    pub namespace: String,
    /// Id of the routing table the call runs against
    pub table_id: i64,
    /// Default outside of quota calls
    pub quota_args: QuotaArgs,
}

/// Derive the routing namespace from the identity attribute
///
/// The identity value looks like `<name>.<namespace>...`; everything after
/// the first `.` is the namespace key. A value without a `.` yields an empty
/// key, which resolves to the default namespace's destinations.
///
/// The key is the whole remainder, not just the second segment:
/// `svc.ns1.svc.cluster.local` routes under `ns1.svc.cluster.local`.
pub fn namespace_of(bag: &dyn Bag, identity_attribute: &str) -> Result<String> {
    match bag.get(identity_attribute) {
        Some(Value::String(ident)) => Ok(ident
            .split_once('.')
            .map(|(_, namespace)| namespace.to_string())
            .unwrap_or_default()),
        _ => Err(Error::IdentityNotString(identity_attribute.to_string())),
    }
}
