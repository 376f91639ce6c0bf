//! attrmesh Core Types and Traits
//!
//! This crate provides the contracts shared by every attrmesh crate:
//! - Attribute values and bags
//! - Adapter, handler and template abstractions
//! - Expression compiler contracts
//! - Configuration documents and resolved snapshots
//! - Core error types and the bounded worker pool

pub mod adapter;
pub mod attribute;
pub mod config;
pub mod config_store;
pub mod directory;
pub mod error;
pub mod expr;
pub mod pool;
pub mod status;
pub mod template;

pub use error::{DispatchErrors, Error, Result, panic_message};
