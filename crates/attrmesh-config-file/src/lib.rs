//! attrmesh Config File
//!
//! [`FileConfigStore`] serves a configuration document from a YAML or TOML
//! file and reports edits to it as configuration changes.

pub mod file_store;

pub use file_store::FileConfigStore;
