//! attrmesh Handler Management
//!
//! Instantiates handlers from a configuration snapshot, reuses handlers whose
//! configuration did not change between snapshots, and closes the ones that
//! were superseded.

pub mod env;
pub mod table;

pub use env::HandlerEnv;
pub use table::{HandlerTable, Signature};
