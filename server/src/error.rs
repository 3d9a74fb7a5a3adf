//! Error types for the ingest server

use thiserror::Error;

/// Device storage failure
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Device not found: {0}")]
    UnknownDevice(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Notification fan-out failure
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    Closed,

    #[error("Notification backend error: {0}")]
    Backend(String),
}

/// Invalid server configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
