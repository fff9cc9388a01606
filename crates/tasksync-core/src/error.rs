//! Core error types for tasksync-core.
//!
//! Stale remote input is not represented here: the apply functions report it
//! through their boolean result. These enums cover the failures that do
//! propagate.

use std::path::PathBuf;
use thiserror::Error;

use crate::sync::device_id::DeviceIdError;
use crate::sync::types::SyncError;

/// Core error type for tasksync-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Local store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Sync engine errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Device identity errors
    #[error("Device ID error: {0}")]
    DeviceId(#[from] DeviceIdError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// Serialized column could not be decoded
    #[error("Column encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Task does not exist
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Lifecycle transition is not allowed from the current state
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// Task is missing a required identity field
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Data directory could not be prepared
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
