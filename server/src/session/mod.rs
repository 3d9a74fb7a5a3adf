//! Session management for tracking connected trackers
//!
//! This module handles:
//! - Binding each device identity to its live connection
//! - Activity timestamps and idle eviction
//! - Writing to a device's transport from any task

mod connection;
mod registry;
mod sweeper;

pub use connection::{BoxedWriter, SessionHandle, SessionInfo};
pub use registry::SessionRegistry;
pub use sweeper::IdleSweeper;
