//! Dispatch loop
//!
//! Pulls envelopes from the queue one at a time and pushes them through the connection
//! supervisor, retrying under backoff until each one is accepted.

pub mod dispatcher;
pub mod stats;

pub use dispatcher::{DispatchPolicy, Dispatcher};
pub use stats::{DispatchStats, DispatchStatsSnapshot};
