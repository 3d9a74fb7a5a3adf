//! Outbound command dispatch
//!
//! Looks up a tracker's live session and writes to its transport. A device
//! that is not connected is an expected outcome, not an error.

mod dispatcher;

pub use dispatcher::CommandDispatcher;
