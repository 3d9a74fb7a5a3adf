//! Tracker ingest server
//!
//! Accepts persistent TCP connections from GPS trackers, decodes their binary
//! frames, acknowledges them and hands the decoded data to storage and
//! notification backends. Operators reach connected devices through the
//! command dispatcher and the admin console.

pub mod admin;
pub mod command;
pub mod config;
pub mod error;
pub mod ingest;
pub mod notify;
pub mod session;
pub mod storage;

pub use admin::AdminConsole;
pub use command::CommandDispatcher;
pub use config::ServerConfig;
pub use ingest::{serve_connection, IngestContext};
pub use notify::{BroadcastNotifier, Notifier};
pub use session::{IdleSweeper, SessionRegistry};
pub use storage::{DeviceStore, MemoryStore};
