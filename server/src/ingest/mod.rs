//! Per-connection ingestion
//!
//! This module handles:
//! - Reassembling the device byte stream into frames
//! - Session binding on login and activity refresh
//! - Acknowledgments
//! - Handing persistence and notification to a per-connection sink task

mod pipeline;
mod sink;

pub use pipeline::{serve_connection, ConnectionWorker, IngestContext};
pub use sink::{BackendJob, BackendSink};
