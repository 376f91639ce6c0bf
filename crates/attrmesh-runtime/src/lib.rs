//! attrmesh Runtime
//!
//! Wires configuration into the dispatcher. Each applied document becomes a
//! new generation: a snapshot, a handler table reusing unchanged handlers and
//! a routing table installed with `change_route`. The previous generation's
//! handlers are closed once its routing table has drained.

pub mod config;
pub mod runtime;

pub use config::RuntimeConfig;
pub use runtime::Runtime;
