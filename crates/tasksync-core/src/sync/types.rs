//! Core types for peer-to-peer synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

/// Connection state of the sync orchestrator.
///
/// `Disconnected → Connecting → Connected`, back to `Disconnected` on any
/// transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Current sync status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Identity of this node.
    pub device_id: String,
    /// Connection state of the orchestrator.
    pub connection: ConnectionState,
    /// Number of events waiting in the outbox.
    pub pending_count: usize,
    /// Last time an event was delivered to or accepted from a peer.
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No peer connected")]
    NotConnected,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Outbox entry type mismatch: queued as {queued}, payload is {actual}")]
    TypeMismatch { queued: String, actual: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// True for connect/send failures that the reconnect loop will retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::NotConnected | SyncError::Io(_)
        )
    }
}
