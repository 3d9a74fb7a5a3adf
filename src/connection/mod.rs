//! Uplink management for the emulated tracker
//!
//! This module handles:
//! - Persistent TCP connection with exponential-backoff reconnection
//! - Login on every connect, then periodic heartbeats and location reports
//! - Classifying server frames into acknowledgments and commands

mod manager;

pub use manager::{ConnectionEvent, ConnectionManager, EmulatorConfig};
