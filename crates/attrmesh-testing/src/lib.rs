//! attrmesh Testing
//!
//! Test support shared by the routing, dispatcher and runtime crates:
//!
//! - [`CallLog`] records builder and handler calls in order
//! - [`FakeTemplate`] and [`FakeAdapter`] inject failures, panics and fixed
//!   results per template
//! - [`TestExpressionCompiler`] compiles the small expression language used
//!   by the fixtures
//! - [`fixtures`] holds configuration snippets that compose into documents
//! - [`MemoryConfigStore`] serves documents from memory and announces updates

pub mod call_log;
pub mod compiler;
pub mod fakes;
pub mod fixtures;
pub mod store;

pub use call_log::CallLog;
pub use compiler::TestExpressionCompiler;
pub use fakes::{FakeAdapter, FakeHandler, FakeTemplate, FakeTemplateSettings, Gate, Harness};
pub use store::MemoryConfigStore;
