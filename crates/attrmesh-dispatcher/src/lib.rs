//! attrmesh Dispatcher
//!
//! Resolves each request against the current routing table and fans it out
//! to the matching handlers:
//!
//! - `check` and `quota` call the handler once per instance and combine the
//!   results into one decision
//! - `report` batches the instances of each destination into a single call
//! - `preprocess` runs attribute generators and writes their mapped outputs
//!
//! The routing table can be replaced at any time with `change_route`; calls
//! already in flight finish against the table they started with.

pub mod dispatcher;
pub mod result;
pub mod session;
pub mod state;

pub use dispatcher::Dispatcher;
pub use result::{StatusCombiner, combine_check_results, combine_quota_results};
pub use session::Session;
pub use state::{DispatchState, DispatchStatePool};
