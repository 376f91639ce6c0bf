//! Lookup of live handlers by configured name

use crate::adapter::{AdapterInfo, Handler};
use std::fmt;
use std::sync::Arc;

/// A live handler together with its metadata
#[derive(Clone)]
pub struct HandlerEntry {
    /// Fully-qualified handler name
    pub name: String,
    pub handler: Arc<dyn Handler>,
    pub adapter: Arc<AdapterInfo>,
}

impl HandlerEntry {
    /// Whether two entries refer to the same handler object
    pub fn same_handler(&self, other: &Arc<dyn Handler>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.handler), Arc::as_ptr(other))
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .field("adapter", &self.adapter.name)
            .finish()
    }
}

/// Resolves configured handler names to live handlers
pub trait HandlerDirectory: Send + Sync {
    fn get(&self, name: &str) -> Option<HandlerEntry>;
}
